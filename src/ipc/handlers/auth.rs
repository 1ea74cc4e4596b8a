use crate::credentials::{normalize_email, verify_password};
use crate::ipc::error::{err, finish};
use crate::ipc::helpers::{db_conn, db_err, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

/// Account tables in the order a login is resolved.
const ROLE_TABLES: [(&str, &str); 3] = [
    ("student", "students"),
    ("teacher", "teachers"),
    ("director", "administrators"),
];

fn find_account(
    conn: &Connection,
    table: &str,
    email: &str,
) -> rusqlite::Result<Option<(String, Option<String>)>> {
    let sql = format!(
        "SELECT id, password_hash FROM {} WHERE lower(email) = ?",
        table
    );
    conn.query_row(&sql, [email], |r| Ok((r.get(0)?, r.get(1)?)))
        .optional()
}

fn handle_login(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let email = normalize_email(&required_str(req, "email")?);
    let Some(password) = req.params.get("password").and_then(|v| v.as_str()) else {
        return Err(err(&req.id, "bad_params", "missing password", None));
    };

    for (role, table) in ROLE_TABLES {
        let account = find_account(conn, table, &email).map_err(db_err(req, "db_query_failed"))?;
        let Some((id, hash)) = account else {
            continue;
        };
        if hash.as_deref().is_some_and(|h| verify_password(h, password)) {
            tracing::info!(role, "login accepted");
            return Ok(json!({ "userId": id, "role": role }));
        }
    }
    Err(err(&req.id, "unauthorized", "invalid email or password", None))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "auth.login" => Some(finish(req, handle_login(state, req))),
        _ => None,
    }
}
