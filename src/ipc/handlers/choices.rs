use crate::ipc::error::{err, finish};
use crate::ipc::handlers::projects::project_status;
use crate::ipc::handlers::setup::assignment_settings;
use crate::ipc::helpers::{
    bad_params, db_conn, db_err, new_id, not_found, opt_str, require_row, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::workflow::ProposalStatus;
use serde_json::{json, Value};
use std::collections::HashSet;

fn read_project_ids(req: &Request) -> Result<Vec<String>, Value> {
    let Some(items) = req.params.get("projectIds").and_then(|v| v.as_array()) else {
        return Err(bad_params(req, "projectIds must be an array"));
    };
    let mut ids = Vec::with_capacity(items.len());
    let mut seen = HashSet::new();
    for item in items {
        let id = item
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| bad_params(req, "projectIds must contain project ids"))?;
        if !seen.insert(id.to_string()) {
            return Err(bad_params(req, format!("duplicate project in choices: {}", id)));
        }
        ids.push(id.to_string());
    }
    Ok(ids)
}

fn handle_choices_submit(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let project_ids = read_project_ids(req)?;
    let partner_id = opt_str(req, "partnerId")?;
    require_row(conn, req, "students", &student_id, "student")?;

    let settings = assignment_settings(conn);
    let n = project_ids.len();
    if n < settings.min_preferences || n > settings.max_preferences {
        return Err(bad_params(
            req,
            format!(
                "choose between {} and {} projects (got {})",
                settings.min_preferences, settings.max_preferences, n
            ),
        ));
    }
    if let Some(partner) = partner_id.as_deref() {
        if !settings.allow_pairs {
            return Err(bad_params(req, "pair work is disabled"));
        }
        if partner == student_id {
            return Err(bad_params(req, "partnerId must differ from studentId"));
        }
        require_row(conn, req, "students", partner, "partner")?;
    }
    for project_id in &project_ids {
        let status = project_status(conn, project_id)
            .map_err(db_err(req, "db_query_failed"))?
            .ok_or_else(|| not_found(req, "project"))?;
        if status != ProposalStatus::Validated {
            return Err(bad_params(
                req,
                format!("project {} is not open for choices", project_id),
            ));
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err(req, "db_tx_failed"))?;
    if let Err(e) = tx.execute(
        "DELETE FROM choices WHERE student_id = ? AND proposed = 0",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return Err(err(&req.id, "db_delete_failed", e.to_string(), None));
    }
    for (i, project_id) in project_ids.iter().enumerate() {
        // A project the student proposed keeps its proposal row.
        if let Err(e) = tx.execute(
            "INSERT OR IGNORE INTO choices(id, student_id, project_id, preference, partner_id, proposed)
             VALUES(?, ?, ?, ?, ?, 0)",
            (new_id(), &student_id, project_id, (i + 1) as i64, &partner_id),
        ) {
            let _ = tx.rollback();
            return Err(err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "choices" })),
            ));
        }
    }
    tx.commit().map_err(db_err(req, "db_tx_failed"))?;
    tracing::info!(student = %student_id, count = n, "choices submitted");
    Ok(json!({ "ok": true, "count": n }))
}

fn handle_choices_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.project_id, p.title, c.preference, c.partner_id, c.proposed
             FROM choices c
             JOIN projects p ON p.id = c.project_id
             WHERE c.student_id = ?
             ORDER BY c.preference, c.proposed DESC, p.title",
        )
        .map_err(db_err(req, "db_query_failed"))?;
    let choices = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "projectId": r.get::<_, String>(1)?,
                "project": r.get::<_, String>(2)?,
                "preference": r.get::<_, i64>(3)?,
                "partnerId": r.get::<_, Option<String>>(4)?,
                "proposed": r.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "choices": choices }))
}

fn handle_choices_count(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let count: i64 = conn
        .query_row("SELECT COUNT(DISTINCT student_id) FROM choices", [], |r| {
            r.get(0)
        })
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "count": count }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "choices.submit" => handle_choices_submit(state, req),
        "choices.list" => handle_choices_list(state, req),
        "choices.count" => handle_choices_count(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
