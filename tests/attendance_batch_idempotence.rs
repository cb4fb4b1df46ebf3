use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_campushubd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campushubd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn seed_user(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    username: &str,
    role: &str,
) -> String {
    let result = request_ok(
        stdin,
        reader,
        id,
        "users.create",
        json!({
            "username": username,
            "email": format!("{}@campus.test", username),
            "fullName": username,
            "role": role
        }),
    );
    result
        .get("userId")
        .and_then(|v| v.as_str())
        .expect("userId")
        .to_string()
}

#[test]
fn resubmitting_a_batch_inserts_nothing_new() {
    let workspace = temp_dir("campushub-attendance-idempotence");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let faculty = seed_user(&mut stdin, &mut reader, "2", "prof.rao", "faculty");
    let s1 = seed_user(&mut stdin, &mut reader, "3", "asha", "student");
    let s2 = seed_user(&mut stdin, &mut reader, "4", "bilal", "student");
    let s3 = seed_user(&mut stdin, &mut reader, "5", "chen", "student");

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "courses.create",
        json!({ "name": "algorithms", "ownerId": faculty }),
    );
    let course_id = course
        .get("courseId")
        .and_then(|v| v.as_str())
        .expect("courseId")
        .to_string();

    for (i, student) in [&s1, &s2, &s3].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("enroll-{}", i),
            "enrollments.create",
            json!({ "userId": student, "courseId": course_id }),
        );
    }

    let records = json!([
        { "studentId": s1, "courseId": course_id, "sessionDate": "2024-03-01", "status": "present" },
        { "studentId": s2, "courseId": course_id, "sessionDate": "2024-03-01", "status": "absent" },
        { "studentId": s3, "courseId": course_id, "sessionDate": "2024-03-01" }
    ]);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "attendance.submitBatch",
        json!({ "markedBy": faculty, "records": records }),
    );
    assert_eq!(first.get("insertedCount").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(
        first
            .get("alreadyExisted")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(0)
    );

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.submitBatch",
        json!({ "markedBy": faculty, "records": records }),
    );
    assert_eq!(second.get("insertedCount").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(
        second
            .get("alreadyExisted")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(3)
    );
    assert_eq!(
        second
            .get("invalid")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(0)
    );

    // Exactly one row per student persisted despite two submissions.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "attendance.listByCourse",
        json!({ "courseId": course_id, "sessionDate": "2024-03-01" }),
    );
    assert_eq!(
        listed
            .get("attendance")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(3)
    );

    // Default status lands as "present" for the record that omitted it.
    let row = listed
        .get("attendance")
        .and_then(|v| v.as_array())
        .and_then(|arr| {
            arr.iter()
                .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(s3.as_str()))
        })
        .cloned()
        .expect("s3 row");
    assert_eq!(row.get("status").and_then(|v| v.as_str()), Some("present"));
    assert_eq!(
        row.get("markedBy").and_then(|v| v.as_str()),
        Some(faculty.as_str())
    );
}
