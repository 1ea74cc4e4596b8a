use crate::ipc::error::finish;
use crate::ipc::helpers::{db_conn, db_err, not_found, opt_bool, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

fn handle_notifications_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let user_id = required_str(req, "userId")?;
    let unread_only = opt_bool(req, "unreadOnly")?.unwrap_or(false);
    let mut stmt = conn
        .prepare(
            "SELECT id, title, message, link, created_at, is_read FROM notifications
             WHERE user_id = ?1 AND (?2 = 0 OR is_read = 0)
             ORDER BY created_at DESC, rowid DESC",
        )
        .map_err(db_err(req, "db_query_failed"))?;
    let notifications = stmt
        .query_map((&user_id, unread_only as i64), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "message": r.get::<_, String>(2)?,
                "link": r.get::<_, Option<String>>(3)?,
                "createdAt": r.get::<_, String>(4)?,
                "read": r.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "notifications": notifications }))
}

fn handle_notifications_mark_read(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let id = required_str(req, "notificationId")?;
    let changed = conn
        .execute("UPDATE notifications SET is_read = 1 WHERE id = ?", [&id])
        .map_err(db_err(req, "db_update_failed"))?;
    if changed == 0 {
        return Err(not_found(req, "notification"));
    }
    Ok(json!({ "ok": true }))
}

fn handle_outbox_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, recipients, subject, body, created_at FROM outbox
             ORDER BY created_at, rowid",
        )
        .map_err(db_err(req, "db_query_failed"))?;
    let mails = stmt
        .query_map([], |r| {
            let recipients: String = r.get(1)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "recipients": recipients
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>(),
                "subject": r.get::<_, String>(2)?,
                "body": r.get::<_, String>(3)?,
                "createdAt": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "mails": mails }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "notifications.list" => handle_notifications_list(state, req),
        "notifications.markRead" => handle_notifications_mark_read(state, req),
        "outbox.list" => handle_outbox_list(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
