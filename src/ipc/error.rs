use crate::ipc::types::Request;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Handlers build their payload or a finished error response; this wraps the payload.
pub fn finish(
    req: &Request,
    result: Result<serde_json::Value, serde_json::Value>,
) -> serde_json::Value {
    match result {
        Ok(payload) => ok(&req.id, payload),
        Err(resp) => {
            let code = resp
                .get("error")
                .and_then(|e| e.get("code"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            tracing::warn!(method = %req.method, code, "request failed");
            resp
        }
    }
}
