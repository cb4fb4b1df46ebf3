use crate::batch::{self, CompositeKey, BATCH_MAX_RECORDS};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::AttendanceStatus;
use crate::store::{AttendanceEntry, AttendanceStore, EnrollmentGate};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn parse_entry(i: usize, record: &serde_json::Value) -> Result<AttendanceEntry, HandlerErr> {
    let obj = record.as_object().ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: format!("record at index {} must be an object", i),
        details: None,
    })?;

    let student_id = obj
        .get("studentId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("record at index {} missing studentId", i),
            details: None,
        })?
        .trim()
        .to_string();
    let course_id = obj
        .get("courseId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("record at index {} missing courseId", i),
            details: None,
        })?
        .trim()
        .to_string();

    let session_date = match obj.get("sessionDate") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) => Some(s.to_string()),
            None => {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!("record at index {} sessionDate must be a string", i),
                    details: None,
                })
            }
        },
    };

    let status = match obj.get("status").and_then(|v| v.as_str()) {
        Some(s) => AttendanceStatus::parse(s).ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("record at index {} status must be present or absent", i),
            details: Some(json!({ "status": s })),
        })?,
        None => AttendanceStatus::Present,
    };

    Ok(AttendanceEntry {
        student_id,
        course_id,
        session_date,
        status,
    })
}

fn entry_json(entry: &AttendanceEntry) -> serde_json::Value {
    json!({
        "studentId": entry.student_id,
        "courseId": entry.course_id,
        "sessionDate": entry.session_date,
        "status": entry.status.as_str()
    })
}

fn key_json(key: &CompositeKey) -> serde_json::Value {
    json!({
        "studentId": key.student_id,
        "courseId": key.course_id,
        "sessionDate": key.day_string()
    })
}

fn submit_batch(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let marked_by = get_required_str(params, "markedBy")?;
    let Some(records_arr) = params.get("records").and_then(|v| v.as_array()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing records[]".to_string(),
            details: None,
        });
    };
    if records_arr.len() > BATCH_MAX_RECORDS {
        return Err(HandlerErr {
            code: "too_many_records",
            message: format!(
                "batch exceeds max records: {} > {}",
                records_arr.len(),
                BATCH_MAX_RECORDS
            ),
            details: Some(json!({ "max": BATCH_MAX_RECORDS })),
        });
    }

    let mut entries = Vec::with_capacity(records_arr.len());
    for (i, record) in records_arr.iter().enumerate() {
        entries.push(parse_entry(i, record)?);
    }

    let store = AttendanceStore::new(conn, EnrollmentGate::default());
    let outcome = batch::submit_batch(&store, entries, &marked_by).map_err(|e| HandlerErr {
        code: "db_batch_failed",
        message: e.to_string(),
        details: None,
    })?;

    let invalid: Vec<serde_json::Value> = outcome
        .invalid
        .iter()
        .map(|(entry, reason)| {
            json!({
                "record": entry_json(entry),
                "reason": reason.code()
            })
        })
        .collect();
    let write_failed: Vec<serde_json::Value> = outcome
        .write_failed
        .iter()
        .map(|(entry, key)| {
            json!({
                "record": entry_json(entry),
                "key": key_json(key),
                "reason": "duplicate_key"
            })
        })
        .collect();

    Ok(json!({
        "insertedCount": outcome.inserted.len(),
        "inserted": outcome.inserted.iter().map(key_json).collect::<Vec<_>>(),
        "alreadyExisted": outcome.already_existed.iter().map(key_json).collect::<Vec<_>>(),
        "invalid": invalid,
        "writeFailed": write_failed
    }))
}

fn list_by_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, course_id, session_date, status, marked_by
             FROM attendance
             WHERE student_id = ?
             ORDER BY session_date, course_id",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "courseId": r.get::<_, String>(1)?,
                "sessionDate": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?,
                "markedBy": r.get::<_, String>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "studentId": student_id, "attendance": rows }))
}

fn list_by_course(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let session_date = match params.get("sessionDate").and_then(|v| v.as_str()) {
        Some(s) => {
            if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_err() {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: "sessionDate must be YYYY-MM-DD".to_string(),
                    details: Some(json!({ "sessionDate": s })),
                });
            }
            Some(s.to_string())
        }
        None => None,
    };

    let (sql, binds): (&str, Vec<String>) = match &session_date {
        Some(d) => (
            "SELECT id, student_id, session_date, status, marked_by
             FROM attendance
             WHERE course_id = ? AND session_date = ?
             ORDER BY student_id",
            vec![course_id.clone(), d.clone()],
        ),
        None => (
            "SELECT id, student_id, session_date, status, marked_by
             FROM attendance
             WHERE course_id = ?
             ORDER BY session_date, student_id",
            vec![course_id.clone()],
        ),
    };

    let mut stmt = conn.prepare(sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "sessionDate": r.get::<_, String>(2)?,
                "status": r.get::<_, String>(3)?,
                "markedBy": r.get::<_, String>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "courseId": course_id, "attendance": rows }))
}

fn handle(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.submitBatch" => Some(handle(state, req, submit_batch)),
        "attendance.listByStudent" => Some(handle(state, req, list_by_student)),
        "attendance.listByCourse" => Some(handle(state, req, list_by_course)),
        _ => None,
    }
}
