use crate::assign::Strategy;
use crate::db;
use crate::ipc::error::finish;
use crate::ipc::helpers::{bad_params, db_conn, db_err};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Assignment,
    Documents,
    Notifications,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "assignment" => Some(Self::Assignment),
            "documents" => Some(Self::Documents),
            "notifications" => Some(Self::Notifications),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Assignment => "setup.assignment",
            Self::Documents => "setup.documents",
            Self::Notifications => "setup.notifications",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Assignment => json!({
            "strategy": "bySubject",
            "minPreferences": 3,
            "maxPreferences": 10,
            "allowPairs": true,
            "supervisorCapacity": 0,
            "supervisionMonths": 6
        }),
        SetupSection::Documents => json!({
            "maxFileBytes": 20 * 1024 * 1024,
            "allowedExtensions": ["pdf", "doc", "docx", "ppt", "pptx", "png", "jpg", "jpeg"]
        }),
        SetupSection::Notifications => json!({
            "emailEnabled": true,
            "signature": "The project management team"
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_extensions(v: &Value, key: &str) -> Result<Vec<String>, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| format!("{} must be an array of strings", key))?;
    if arr.is_empty() {
        return Err(format!("{} must not be empty", key));
    }
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let ext = item
            .as_str()
            .ok_or_else(|| format!("{} must be an array of strings", key))?
            .trim()
            .trim_start_matches('.')
            .to_ascii_lowercase();
        if ext.is_empty() || ext.len() > 10 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!("{} contains an invalid extension", key));
        }
        if !out.contains(&ext) {
            out.push(ext);
        }
    }
    Ok(out)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Assignment => match k.as_str() {
                "strategy" => {
                    let s = v.as_str().ok_or("strategy must be string")?;
                    if Strategy::parse(s).is_none() {
                        return Err("strategy must be one of: bySubject, byMerit".into());
                    }
                    obj.insert(k.clone(), Value::String(s.to_string()));
                }
                "minPreferences" | "maxPreferences" => {
                    obj.insert(k.clone(), json!(parse_i64_range(v, k, 1, 20)?));
                }
                "allowPairs" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "supervisorCapacity" => {
                    obj.insert(k.clone(), json!(parse_i64_range(v, k, 0, 100)?));
                }
                "supervisionMonths" => {
                    obj.insert(k.clone(), json!(parse_i64_range(v, k, 1, 24)?));
                }
                _ => return Err(format!("unknown assignment field: {}", k)),
            },
            SetupSection::Documents => match k.as_str() {
                "maxFileBytes" => {
                    obj.insert(k.clone(), json!(parse_i64_range(v, k, 1, 100 * 1024 * 1024)?));
                }
                "allowedExtensions" => {
                    obj.insert(k.clone(), json!(parse_extensions(v, k)?));
                }
                _ => return Err(format!("unknown documents field: {}", k)),
            },
            SetupSection::Notifications => match k.as_str() {
                "emailEnabled" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "signature" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                _ => return Err(format!("unknown notifications field: {}", k)),
            },
        }
    }

    if let SetupSection::Assignment = section {
        let min = obj.get("minPreferences").and_then(|v| v.as_i64()).unwrap_or(1);
        let max = obj.get("maxPreferences").and_then(|v| v.as_i64()).unwrap_or(min);
        if max < min {
            return Err("maxPreferences must be >= minPreferences".into());
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults instead of blocking.
            let mut merged = current.clone();
            if merge_section_patch(section, &mut merged, saved_obj).is_ok() {
                current = merged;
            }
        }
    }
    Ok(current)
}

#[derive(Debug, Clone)]
pub struct AssignmentSettings {
    pub strategy: Strategy,
    pub min_preferences: usize,
    pub max_preferences: usize,
    pub allow_pairs: bool,
    pub supervisor_capacity: usize,
    pub supervision_months: u32,
}

#[derive(Debug, Clone)]
pub struct DocumentSettings {
    pub max_file_bytes: u64,
    pub allowed_extensions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub email_enabled: bool,
    pub signature: String,
}

fn section_or_default(conn: &Connection, section: SetupSection) -> Value {
    load_section(conn, section).unwrap_or_else(|e| {
        tracing::warn!(key = section.key(), error = %e, "falling back to default setup");
        default_section(section)
    })
}

pub fn assignment_settings(conn: &Connection) -> AssignmentSettings {
    let obj = section_or_default(conn, SetupSection::Assignment);
    let num = |k: &str, d: i64| obj.get(k).and_then(|v| v.as_i64()).unwrap_or(d);
    AssignmentSettings {
        strategy: obj
            .get("strategy")
            .and_then(|v| v.as_str())
            .and_then(Strategy::parse)
            .unwrap_or(Strategy::BySubject),
        min_preferences: num("minPreferences", 3).max(1) as usize,
        max_preferences: num("maxPreferences", 10).max(1) as usize,
        allow_pairs: obj
            .get("allowPairs")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        supervisor_capacity: num("supervisorCapacity", 0).max(0) as usize,
        supervision_months: num("supervisionMonths", 6).clamp(1, 24) as u32,
    }
}

pub fn document_settings(conn: &Connection) -> DocumentSettings {
    let obj = section_or_default(conn, SetupSection::Documents);
    DocumentSettings {
        max_file_bytes: obj
            .get("maxFileBytes")
            .and_then(|v| v.as_u64())
            .unwrap_or(20 * 1024 * 1024),
        allowed_extensions: obj
            .get("allowedExtensions")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

pub fn notification_settings(conn: &Connection) -> NotificationSettings {
    let obj = section_or_default(conn, SetupSection::Notifications);
    NotificationSettings {
        email_enabled: obj
            .get("emailEnabled")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        signature: obj
            .get("signature")
            .and_then(|v| v.as_str())
            .unwrap_or("The project management team")
            .to_string(),
    }
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let fail = db_err(req, "db_query_failed");
    Ok(json!({
        "assignment": load_section(conn, SetupSection::Assignment).map_err(&fail)?,
        "documents": load_section(conn, SetupSection::Documents).map_err(&fail)?,
        "notifications": load_section(conn, SetupSection::Notifications).map_err(&fail)?,
    }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return Err(bad_params(req, "missing section"));
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return Err(bad_params(req, "unknown section"));
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(bad_params(req, "patch must be an object"));
    };

    let mut current = load_section(conn, section).map_err(db_err(req, "db_query_failed"))?;
    merge_section_patch(section, &mut current, patch_obj).map_err(|msg| bad_params(req, msg))?;
    db::settings_set_json(conn, section.key(), &current)
        .map_err(db_err(req, "db_update_failed"))?;
    tracing::info!(section = section.key(), "setup updated");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "setup.get" => Some(finish(req, handle_setup_get(state, req))),
        "setup.update" => Some(finish(req, handle_setup_update(state, req))),
        _ => None,
    }
}
