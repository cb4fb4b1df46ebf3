use crate::batch::{self, CompositeKey, BATCH_MAX_RECORDS};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::Grade;
use crate::store::{EnrollmentGate, ResultEntry, ResultStore};
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

fn field_str(
    i: usize,
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<String, HandlerErr> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("record at index {} missing {}", i, key),
            details: None,
        })
}

fn optional_field_str(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().to_string())
}

fn parse_entry(i: usize, record: &serde_json::Value) -> Result<ResultEntry, HandlerErr> {
    let obj = record.as_object().ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: format!("record at index {} must be an object", i),
        details: None,
    })?;

    let student_id = field_str(i, obj, "studentId")?;
    let course_id = field_str(i, obj, "courseId")?;
    let subject = field_str(i, obj, "subject")?;

    let exam_date = match obj.get("examDate") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) => Some(s.to_string()),
            None => {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!("record at index {} examDate must be a string", i),
                    details: None,
                })
            }
        },
    };

    let marks = obj.get("marks").and_then(|v| v.as_f64()).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: format!("record at index {} missing marks", i),
        details: None,
    })?;
    if !(0.0..=100.0).contains(&marks) {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("record at index {} marks must be between 0 and 100", i),
            details: Some(json!({ "marks": marks })),
        });
    }

    let grade_raw = field_str(i, obj, "grade")?;
    let grade = Grade::parse(&grade_raw).ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: format!("record at index {} grade must be one of: O, A, B, C, D, E, F", i),
        details: Some(json!({ "grade": grade_raw })),
    })?;

    Ok(ResultEntry {
        student_id,
        course_id,
        exam_date,
        subject,
        marks,
        grade,
        remarks: optional_field_str(obj, "remarks"),
        semester: optional_field_str(obj, "semester"),
        academic_year: optional_field_str(obj, "academicYear"),
    })
}

fn entry_json(entry: &ResultEntry) -> serde_json::Value {
    json!({
        "studentId": entry.student_id,
        "courseId": entry.course_id,
        "examDate": entry.exam_date,
        "subject": entry.subject,
        "marks": entry.marks,
        "grade": entry.grade.as_str()
    })
}

fn key_json(key: &CompositeKey) -> serde_json::Value {
    json!({
        "studentId": key.student_id,
        "courseId": key.course_id,
        "examDate": key.day_string()
    })
}

fn submit_batch(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let created_by = get_required_str(params, "createdBy")?;
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

    let store = ResultStore::new(conn, EnrollmentGate::default());
    let outcome = batch::submit_batch(&store, entries, &created_by).map_err(|e| HandlerErr {
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
            "SELECT id, course_id, exam_date, subject, marks, grade, remarks, semester,
                    academic_year, created_by
             FROM results
             WHERE student_id = ?
             ORDER BY exam_date, course_id",
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
                "examDate": r.get::<_, String>(2)?,
                "subject": r.get::<_, String>(3)?,
                "marks": r.get::<_, f64>(4)?,
                "grade": r.get::<_, String>(5)?,
                "remarks": r.get::<_, Option<String>>(6)?,
                "semester": r.get::<_, Option<String>>(7)?,
                "academicYear": r.get::<_, Option<String>>(8)?,
                "createdBy": r.get::<_, String>(9)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "studentId": student_id, "results": rows }))
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
        "results.submitBatch" => Some(handle(state, req, submit_batch)),
        "results.listByStudent" => Some(handle(state, req, list_by_student)),
        _ => None,
    }
}
