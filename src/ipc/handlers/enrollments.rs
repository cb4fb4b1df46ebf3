use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::{EnrollmentStatus, UserRole};
use crate::store::now_rfc3339;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const LIST_DEFAULT_LIMIT: i64 = 10;
const LIST_MAX_LIMIT: i64 = 50;

fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };
    let role = match req.params.get("role").and_then(|v| v.as_str()) {
        Some(v) => match UserRole::parse(v) {
            Some(r) => r,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "role must be one of: admin, faculty, student, ta",
                    Some(json!({ "role": v })),
                )
            }
        },
        None => UserRole::Student,
    };
    let remarks = req
        .params
        .get("remarks")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let user_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&user_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if user_exists.is_none() {
        return err(&req.id, "not_found", "user not found", None);
    }

    let course_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM courses WHERE id = ? AND deleted_at IS NULL",
            [&course_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if course_exists.is_none() {
        return err(&req.id, "not_found", "course not found", None);
    }

    // One active enrollment per user+course; completed/dropped rows do
    // not block re-enrollment.
    let already_active: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE user_id = ? AND course_id = ? AND status = 'active'",
            (&user_id, &course_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if already_active.is_some() {
        return err(
            &req.id,
            "already_enrolled",
            "user already has an active enrollment in this course",
            None,
        );
    }

    let enrollment_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(id, user_id, course_id, role, status, remarks, enrolled_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &enrollment_id,
            &user_id,
            &course_id,
            role.as_str(),
            EnrollmentStatus::Active.as_str(),
            &remarks,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    ok(
        &req.id,
        json!({
            "enrollmentId": enrollment_id,
            "userId": user_id,
            "courseId": course_id,
            "status": EnrollmentStatus::Active.as_str()
        }),
    )
}

fn handle_enrollments_set_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let enrollment_id = match req.params.get("enrollmentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing enrollmentId", None),
    };
    let status = match req
        .params
        .get("status")
        .and_then(|v| v.as_str())
        .and_then(EnrollmentStatus::parse)
    {
        Some(s) => s,
        None => {
            return err(
                &req.id,
                "bad_params",
                "status must be one of: active, completed, dropped",
                None,
            )
        }
    };

    let updated = match conn.execute(
        "UPDATE enrollments SET status = ? WHERE id = ?",
        (status.as_str(), &enrollment_id),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "enrollments" })),
            )
        }
    };
    if updated == 0 {
        return err(&req.id, "not_found", "enrollment not found", None);
    }

    ok(
        &req.id,
        json!({ "enrollmentId": enrollment_id, "status": status.as_str() }),
    )
}

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let status = match req.params.get("status").and_then(|v| v.as_str()) {
        Some(v) => match EnrollmentStatus::parse(v) {
            Some(s) => s,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "status must be one of: active, completed, dropped",
                    Some(json!({ "status": v })),
                )
            }
        },
        None => EnrollmentStatus::Active,
    };

    let mut page = req.params.get("page").and_then(|v| v.as_i64()).unwrap_or(1);
    if page <= 0 {
        page = 1;
    }
    let mut limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(LIST_DEFAULT_LIMIT);
    if limit <= 0 || limit >= LIST_MAX_LIMIT {
        limit = LIST_DEFAULT_LIMIT;
    }
    let offset = (page - 1) * limit;

    let mut stmt = match conn.prepare(
        "SELECT e.id, e.user_id, u.username, e.course_id, c.name, e.role, e.status, e.enrolled_at
         FROM enrollments e
         JOIN users u ON u.id = e.user_id
         JOIN courses c ON c.id = e.course_id
         WHERE e.status = ?
         ORDER BY e.enrolled_at, e.id
         LIMIT ? OFFSET ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((status.as_str(), limit, offset), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "userId": row.get::<_, String>(1)?,
                "username": row.get::<_, String>(2)?,
                "courseId": row.get::<_, String>(3)?,
                "courseName": row.get::<_, String>(4)?,
                "role": row.get::<_, String>(5)?,
                "status": row.get::<_, String>(6)?,
                "enrolledAt": row.get::<_, String>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    let enrollments = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let total: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE status = ?",
        [status.as_str()],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let total_pages = (total + limit - 1) / limit;

    ok(
        &req.id,
        json!({
            "enrollments": enrollments,
            "metadata": {
                "totalPages": total_pages,
                "currentPage": page,
                "currentLimit": limit
            }
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.setStatus" => Some(handle_enrollments_set_status(state, req)),
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        _ => None,
    }
}
