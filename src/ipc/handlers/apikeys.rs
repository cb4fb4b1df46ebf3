use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::store::now_rfc3339;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

fn key_digest(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn handle_apikeys_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let created_by = match req.params.get("createdBy").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing createdBy", None),
    };
    let expire_at = match req.params.get("expireAt").and_then(|v| v.as_str()) {
        Some(v) => match DateTime::parse_from_rfc3339(v) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(_) => {
                return err(
                    &req.id,
                    "bad_params",
                    "expireAt must be an RFC 3339 timestamp",
                    Some(json!({ "expireAt": v })),
                )
            }
        },
        None => return err(&req.id, "bad_params", "missing expireAt", None),
    };
    if expire_at <= Utc::now() {
        return err(&req.id, "bad_params", "expireAt must be in the future", None);
    }

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

    // The raw key leaves the process exactly once, in this response.
    let raw_key = format!(
        "chk_{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    );
    let key_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO api_keys(id, key_hash, created_by, expire_at, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &key_id,
            &key_digest(&raw_key),
            &created_by,
            &expire_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "api_keys" })),
        );
    }

    ok(
        &req.id,
        json!({
            "apiKeyId": key_id,
            "key": raw_key,
            "expireAt": expire_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        }),
    )
}

fn handle_apikeys_verify(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let raw_key = match req.params.get("key").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing key", None),
    };

    let row: Option<(String, String)> = match conn
        .query_row(
            "SELECT created_by, expire_at FROM api_keys WHERE key_hash = ?",
            [&key_digest(&raw_key)],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let Some((created_by, expire_at)) = row else {
        return ok(&req.id, json!({ "valid": false }));
    };

    let expired = match DateTime::parse_from_rfc3339(&expire_at) {
        Ok(dt) => dt.with_timezone(&Utc) <= Utc::now(),
        Err(_) => true,
    };
    if expired {
        return ok(&req.id, json!({ "valid": false, "expired": true }));
    }

    ok(
        &req.id,
        json!({ "valid": true, "createdBy": created_by, "expireAt": expire_at }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "apiKeys.create" => Some(handle_apikeys_create(state, req)),
        "apiKeys.verify" => Some(handle_apikeys_verify(state, req)),
        _ => None,
    }
}
