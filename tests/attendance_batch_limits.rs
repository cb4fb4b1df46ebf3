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

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
}

#[test]
fn oversized_batches_are_rejected_whole() {
    let workspace = temp_dir("campushub-batch-limits");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let records: Vec<serde_json::Value> = (0..31)
        .map(|i| {
            json!({
                "studentId": format!("s{}", i),
                "courseId": "c1",
                "sessionDate": "2024-03-01"
            })
        })
        .collect();

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.submitBatch",
        json!({ "markedBy": "u-admin", "records": records }),
    );
    assert_eq!(error_code(&resp), "too_many_records");

    // Nothing was written.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.listByCourse",
        json!({ "courseId": "c1" }),
    );
    assert_eq!(
        listed
            .get("attendance")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(0)
    );
}

#[test]
fn structurally_bad_requests_fail_before_the_pipeline() {
    let workspace = temp_dir("campushub-batch-bad-params");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let no_actor = request(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.submitBatch",
        json!({ "records": [] }),
    );
    assert_eq!(error_code(&no_actor), "bad_params");

    let no_records = request(
        &mut stdin,
        &mut reader,
        "3",
        "attendance.submitBatch",
        json!({ "markedBy": "u-admin" }),
    );
    assert_eq!(error_code(&no_records), "bad_params");

    let bad_status = request(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.submitBatch",
        json!({
            "markedBy": "u-admin",
            "records": [
                { "studentId": "s1", "courseId": "c1", "status": "late" }
            ]
        }),
    );
    assert_eq!(error_code(&bad_status), "bad_params");

    let missing_student = request(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.submitBatch",
        json!({
            "markedBy": "u-admin",
            "records": [
                { "courseId": "c1", "sessionDate": "2024-03-01" }
            ]
        }),
    );
    assert_eq!(error_code(&missing_student), "bad_params");
}

#[test]
fn empty_batches_produce_an_empty_outcome() {
    let workspace = temp_dir("campushub-batch-empty");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let outcome = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "attendance.submitBatch",
        json!({ "markedBy": "u-admin", "records": [] }),
    );
    assert_eq!(outcome.get("insertedCount").and_then(|v| v.as_u64()), Some(0));
    for bucket in ["inserted", "alreadyExisted", "invalid", "writeFailed"] {
        assert_eq!(
            outcome.get(bucket).and_then(|v| v.as_array()).map(|v| v.len()),
            Some(0),
            "bucket {} not empty",
            bucket
        );
    }
}
