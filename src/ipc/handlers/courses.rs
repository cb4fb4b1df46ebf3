use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::now_rfc3339;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_lowercase(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let owner_id = match req.params.get("ownerId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing ownerId", None),
    };
    let description = req
        .params
        .get("description")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());
    let price = req.params.get("price").and_then(|v| v.as_f64()).unwrap_or(0.0);
    if price < 0.0 {
        return err(
            &req.id,
            "bad_params",
            "price must be >= 0",
            Some(json!({ "price": price })),
        );
    }

    let owner_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&owner_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if owner_exists.is_none() {
        return err(&req.id, "not_found", "owner user not found", None);
    }

    let course_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, name, description, price, owner_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&course_id, &name, &description, price, &owner_id, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    ok(&req.id, json!({ "courseId": course_id, "name": name }))
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "courses": [] }));
    };

    // Enrollment counts let the caller render a dashboard without extra
    // round trips. Correlated subquery avoids double counting.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.description,
           c.price,
           (SELECT COUNT(*) FROM enrollments e
            WHERE e.course_id = c.id AND e.status = 'active') AS active_enrollments
         FROM courses c
         WHERE c.deleted_at IS NULL
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "description": row.get::<_, Option<String>>(2)?,
                "price": row.get::<_, f64>(3)?,
                "activeEnrollments": row.get::<_, i64>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };

    let row = conn
        .query_row(
            "SELECT id, name, description, price, owner_id, created_at
             FROM courses WHERE id = ? AND deleted_at IS NULL",
            [&course_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "description": r.get::<_, Option<String>>(2)?,
                    "price": r.get::<_, f64>(3)?,
                    "ownerId": r.get::<_, String>(4)?,
                    "createdAt": r.get::<_, String>(5)?
                }))
            },
        )
        .optional();

    match row {
        Ok(Some(course)) => ok(&req.id, json!({ "course": course })),
        Ok(None) => err(&req.id, "not_found", "course not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

// Soft delete, as upstream records may reference the course.
fn handle_courses_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let course_id = match req.params.get("courseId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing courseId", None),
    };

    let now = now_rfc3339();
    let updated = match conn.execute(
        "UPDATE courses SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        (&now, &course_id),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "courses" })),
            )
        }
    };

    if updated == 0 {
        return err(&req.id, "not_found", "course not found", None);
    }
    ok(&req.id, json!({ "courseId": course_id, "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.get" => Some(handle_courses_get(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        _ => None,
    }
}
