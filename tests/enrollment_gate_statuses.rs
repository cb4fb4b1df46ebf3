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

#[test]
fn dropped_enrollments_stop_gating_until_reenrollment() {
    let workspace = temp_dir("campushub-gate-statuses");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let faculty = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({
            "username": "prof.wei",
            "email": "prof.wei@campus.test",
            "fullName": "prof.wei",
            "role": "faculty"
        }),
    )
    .get("userId")
    .and_then(|v| v.as_str())
    .expect("userId")
    .to_string();

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({
            "username": "karim",
            "email": "karim@campus.test",
            "fullName": "karim",
            "role": "student"
        }),
    )
    .get("userId")
    .and_then(|v| v.as_str())
    .expect("userId")
    .to_string();

    let course_id = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "courses.create",
        json!({ "name": "linear algebra", "ownerId": faculty }),
    )
    .get("courseId")
    .and_then(|v| v.as_str())
    .expect("courseId")
    .to_string();

    let enrollment_id = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "enrollments.create",
        json!({ "userId": student, "courseId": course_id }),
    )
    .get("enrollmentId")
    .and_then(|v| v.as_str())
    .expect("enrollmentId")
    .to_string();

    // A second active enrollment for the same pair is refused.
    let dup = request(
        &mut stdin,
        &mut reader,
        "6",
        "enrollments.create",
        json!({ "userId": student, "courseId": course_id }),
    );
    assert_eq!(dup.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        dup.get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("already_enrolled")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "enrollments.setStatus",
        json!({ "enrollmentId": enrollment_id, "status": "dropped" }),
    );

    // Dropped: the relationship gate no longer passes.
    let while_dropped = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "attendance.submitBatch",
        json!({
            "markedBy": faculty,
            "records": [
                { "studentId": student, "courseId": course_id, "sessionDate": "2024-04-02" }
            ]
        }),
    );
    assert_eq!(
        while_dropped.get("insertedCount").and_then(|v| v.as_u64()),
        Some(0)
    );
    let invalid = while_dropped
        .get("invalid")
        .and_then(|v| v.as_array())
        .expect("invalid");
    assert_eq!(invalid.len(), 1);
    assert_eq!(
        invalid[0].get("reason").and_then(|v| v.as_str()),
        Some("not_enrolled")
    );

    // Re-enrollment is allowed after the drop and restores the gate.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "enrollments.create",
        json!({ "userId": student, "courseId": course_id }),
    );
    let after_reenroll = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "attendance.submitBatch",
        json!({
            "markedBy": faculty,
            "records": [
                { "studentId": student, "courseId": course_id, "sessionDate": "2024-04-02" }
            ]
        }),
    );
    assert_eq!(
        after_reenroll.get("insertedCount").and_then(|v| v.as_u64()),
        Some(1)
    );

    // Only the fresh enrollment is active; the dropped one stays on record.
    let active = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "enrollments.list",
        json!({ "status": "active" }),
    );
    let rows = active
        .get("enrollments")
        .and_then(|v| v.as_array())
        .expect("enrollments");
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("username").and_then(|v| v.as_str()),
        Some("karim")
    );
    let dropped = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "enrollments.list",
        json!({ "status": "dropped" }),
    );
    assert_eq!(
        dropped
            .get("enrollments")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(1)
    );
}
