use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::workflow::TransitionError;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn db_err<'a, E: std::fmt::Display>(req: &'a Request, code: &'a str) -> impl Fn(E) -> Value + 'a {
    move |e| err(&req.id, code, e.to_string(), None)
}

pub fn bad_params(req: &Request, message: impl Into<String>) -> Value {
    err(&req.id, "bad_params", message, None)
}

pub fn not_found(req: &Request, what: &str) -> Value {
    err(&req.id, "not_found", format!("{} not found", what), None)
}

pub fn transition_failed(req: &Request, e: &TransitionError) -> Value {
    err(&req.id, "invalid_transition", e.to_string(), None)
}

pub fn required_str(req: &Request, key: &str) -> Result<String, Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_params(req, format!("missing {}", key)))
}

/// Absent, null and blank strings all read as None.
pub fn opt_str_in(req: &Request, obj: &Value, key: &str) -> Result<Option<String>, Value> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| bad_params(req, format!("{} must be string or null", key)))?
                .trim();
            Ok((!s.is_empty()).then(|| s.to_string()))
        }
    }
}

pub fn opt_str(req: &Request, key: &str) -> Result<Option<String>, Value> {
    opt_str_in(req, &req.params, key)
}

pub fn opt_bool(req: &Request, key: &str) -> Result<Option<bool>, Value> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| bad_params(req, format!("{} must be boolean", key))),
    }
}

pub fn opt_f64_range(
    req: &Request,
    obj: &Value,
    key: &str,
    min: f64,
    max: f64,
) -> Result<Option<f64>, Value> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v
                .as_f64()
                .ok_or_else(|| bad_params(req, format!("{} must be a number", key)))?;
            if !(min..=max).contains(&n) {
                return Err(bad_params(req, format!("{} must be in {}..={}", key, min, max)));
            }
            Ok(Some(n))
        }
    }
}

pub fn opt_i64_range(
    req: &Request,
    obj: &Value,
    key: &str,
    min: i64,
    max: i64,
) -> Result<Option<i64>, Value> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v
                .as_i64()
                .ok_or_else(|| bad_params(req, format!("{} must be integer", key)))?;
            if !(min..=max).contains(&n) {
                return Err(bad_params(req, format!("{} must be in {}..={}", key, min, max)));
            }
            Ok(Some(n))
        }
    }
}

pub fn parse_date(req: &Request, key: &str, raw: &str) -> Result<NaiveDate, Value> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| bad_params(req, format!("{} must be a YYYY-MM-DD date", key)))
}

pub fn required_date(req: &Request, key: &str) -> Result<NaiveDate, Value> {
    let raw = required_str(req, key)?;
    parse_date(req, key, &raw)
}

pub fn opt_date(req: &Request, key: &str) -> Result<Option<NaiveDate>, Value> {
    match opt_str(req, key)? {
        Some(raw) => parse_date(req, key, &raw).map(Some),
        None => Ok(None),
    }
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn row_exists(conn: &Connection, table: &str, id: &str) -> rusqlite::Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let hit: Option<i64> = conn.query_row(&sql, [id], |r| r.get(0)).optional()?;
    Ok(hit.is_some())
}

/// Fails with `not_found` unless the row exists.
pub fn require_row(
    conn: &Connection,
    req: &Request,
    table: &str,
    id: &str,
    what: &str,
) -> Result<(), Value> {
    match row_exists(conn, table, id) {
        Ok(true) => Ok(()),
        Ok(false) => Err(not_found(req, what)),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

pub fn full_name(first: &str, last: &str) -> String {
    format!("{} {}", first, last)
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
