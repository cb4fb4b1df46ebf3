use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::AnnouncementTarget;
use crate::store::now_rfc3339;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const LIST_DEFAULT_LIMIT: i64 = 10;
const LIST_MAX_LIMIT: i64 = 50;

fn handle_announcements_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let title = match req.params.get("title").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing title", None),
    };
    let created_by = match req.params.get("createdBy").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing createdBy", None),
    };
    let message = req
        .params
        .get("message")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());
    let course_id = req
        .params
        .get("courseId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let target = match req.params.get("target").and_then(|v| v.as_str()) {
        Some(v) => match AnnouncementTarget::parse(v) {
            Some(t) => t,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "target must be one of: all, admins, faculty, students",
                    Some(json!({ "target": v })),
                )
            }
        },
        None => AnnouncementTarget::All,
    };

    let creator_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&created_by], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if creator_exists.is_none() {
        return err(&req.id, "not_found", "creator user not found", None);
    }

    if let Some(cid) = &course_id {
        let course_exists: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM courses WHERE id = ? AND deleted_at IS NULL",
                [cid],
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
    }

    let announcement_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO announcements(id, title, message, course_id, target, status, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, 'active', ?, ?)",
        (
            &announcement_id,
            &title,
            &message,
            &course_id,
            target.as_str(),
            &created_by,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "announcements" })),
        );
    }

    ok(
        &req.id,
        json!({ "announcementId": announcement_id, "title": title }),
    )
}

fn handle_announcements_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
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

    let mut clauses: Vec<&str> = vec!["deleted_at IS NULL"];
    let mut binds: Vec<Value> = Vec::new();

    if let Some(title) = req.params.get("title").and_then(|v| v.as_str()) {
        clauses.push("title LIKE ?");
        binds.push(Value::Text(format!("%{}%", title)));
    }
    if let Some(target) = req.params.get("target").and_then(|v| v.as_str()) {
        if AnnouncementTarget::parse(target).is_none() {
            return err(
                &req.id,
                "bad_params",
                "target must be one of: all, admins, faculty, students",
                Some(json!({ "target": target })),
            );
        }
        clauses.push("target = ?");
        binds.push(Value::Text(target.to_string()));
    }
    if let Some(status) = req.params.get("status").and_then(|v| v.as_str()) {
        clauses.push("status = ?");
        binds.push(Value::Text(status.to_string()));
    }
    if let Some(course_id) = req.params.get("courseId").and_then(|v| v.as_str()) {
        clauses.push("course_id = ?");
        binds.push(Value::Text(course_id.to_string()));
    }
    if let Some(creator) = req.params.get("creator").and_then(|v| v.as_str()) {
        clauses.push("created_by = ?");
        binds.push(Value::Text(creator.to_string()));
    }

    let sql = format!(
        "SELECT id, title, message, course_id, target, status, created_by, created_at
         FROM announcements
         WHERE {}
         ORDER BY created_at, id
         LIMIT ? OFFSET ?",
        clauses.join(" AND ")
    );
    binds.push(Value::Integer(limit));
    binds.push(Value::Integer(offset));

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "message": r.get::<_, Option<String>>(2)?,
                "courseId": r.get::<_, Option<String>>(3)?,
                "target": r.get::<_, String>(4)?,
                "status": r.get::<_, String>(5)?,
                "createdBy": r.get::<_, String>(6)?,
                "createdAt": r.get::<_, String>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(announcements) => ok(
            &req.id,
            json!({
                "announcements": announcements,
                "metadata": {
                    "currentPage": page,
                    "currentLimit": limit
                }
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_announcements_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let announcement_id = match req.params.get("announcementId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing announcementId", None),
    };

    let now = now_rfc3339();
    let updated = match conn.execute(
        "UPDATE announcements SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        (&now, &announcement_id),
    ) {
        Ok(n) => n,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "announcements" })),
            )
        }
    };
    if updated == 0 {
        return err(&req.id, "not_found", "announcement not found", None);
    }

    ok(&req.id, json!({ "announcementId": announcement_id, "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "announcements.create" => Some(handle_announcements_create(state, req)),
        "announcements.list" => Some(handle_announcements_list(state, req)),
        "announcements.delete" => Some(handle_announcements_delete(state, req)),
        _ => None,
    }
}
