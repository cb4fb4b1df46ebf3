use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::model::UserRole;
use crate::store::now_rfc3339;
use rusqlite::{ErrorCode, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let username = match req.params.get("username").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_lowercase(),
        _ => return err(&req.id, "bad_params", "missing username", None),
    };
    let email = match req.params.get("email").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_lowercase(),
        _ => return err(&req.id, "bad_params", "missing email", None),
    };
    let full_name = match req.params.get("fullName").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing fullName", None),
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

    let user_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    let insert = conn.execute(
        "INSERT INTO users(id, username, email, full_name, role, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&user_id, &username, &email, &full_name, role.as_str(), &now),
    );
    match insert {
        Ok(_) => ok(
            &req.id,
            json!({
                "userId": user_id,
                "username": username,
                "role": role.as_str()
            }),
        ),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            err(
                &req.id,
                "already_exists",
                "username or email already taken",
                None,
            )
        }
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        ),
    }
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let role_filter = req.params.get("role").and_then(|v| v.as_str());
    if let Some(r) = role_filter {
        if UserRole::parse(r).is_none() {
            return err(
                &req.id,
                "bad_params",
                "role must be one of: admin, faculty, student, ta",
                Some(json!({ "role": r })),
            );
        }
    }

    let (sql, binds): (&str, Vec<String>) = match role_filter {
        Some(r) => (
            "SELECT id, username, email, full_name, role FROM users WHERE role = ? ORDER BY username",
            vec![r.to_string()],
        ),
        None => (
            "SELECT id, username, email, full_name, role FROM users ORDER BY username",
            Vec::new(),
        ),
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "username": row.get::<_, String>(1)?,
                "email": row.get::<_, String>(2)?,
                "fullName": row.get::<_, String>(3)?,
                "role": row.get::<_, String>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_set_role(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let user_id = match req.params.get("userId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing userId", None),
    };
    let role = match req
        .params
        .get("role")
        .and_then(|v| v.as_str())
        .and_then(UserRole::parse)
    {
        Some(r) => r,
        None => {
            return err(
                &req.id,
                "bad_params",
                "role must be one of: admin, faculty, student, ta",
                None,
            )
        }
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&user_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "user not found", None);
    }

    let now = now_rfc3339();
    if let Err(e) = conn.execute(
        "UPDATE users SET role = ?, updated_at = ? WHERE id = ?",
        (role.as_str(), &now, &user_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(&req.id, json!({ "userId": user_id, "role": role.as_str() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle_users_create(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        "users.setRole" => Some(handle_users_set_role(state, req)),
        _ => None,
    }
}
