use crate::ipc::error::{err, finish};
use crate::ipc::helpers::{
    bad_params, db_conn, db_err, fmt_date, full_name, is_unique_violation, new_id, not_found,
    opt_str, require_row, required_date, required_str, transition_failed,
};
use crate::ipc::types::{AppState, Request};
use crate::workflow::{
    promoted_internship_status, report_status, DocumentKind, DocumentStatus, InternshipStatus,
};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

const INTERNSHIP_SELECT: &str = "SELECT i.id, i.student_id, s.first_name, s.last_name, i.company,
            i.project, i.start_date, i.end_date, i.location, i.industrial_supervisor,
            i.supervisor_email, i.description, i.status
     FROM internships i
     JOIN students s ON s.id = i.student_id";

fn internship_documents(
    conn: &Connection,
    internship_id: &str,
) -> rusqlite::Result<Vec<(DocumentKind, DocumentStatus)>> {
    let mut stmt = conn.prepare("SELECT kind, status FROM documents WHERE internship_id = ?")?;
    let rows = stmt
        .query_map([internship_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter_map(|(k, s)| Some((DocumentKind::parse(&k)?, DocumentStatus::parse(&s)?)))
        .collect())
}

pub fn internship_status(
    conn: &Connection,
    internship_id: &str,
) -> rusqlite::Result<Option<InternshipStatus>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM internships WHERE id = ?",
            [internship_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| InternshipStatus::parse(&s)))
}

/// Closes an in-progress internship once one of its documents is validated.
pub fn promote_internship(
    conn: &Connection,
    internship_id: &str,
) -> rusqlite::Result<Option<InternshipStatus>> {
    let Some(current) = internship_status(conn, internship_id)? else {
        return Ok(None);
    };
    let docs = internship_documents(conn, internship_id)?;
    let Some(next) = promoted_internship_status(current, docs) else {
        return Ok(None);
    };
    conn.execute(
        "UPDATE internships SET status = ? WHERE id = ?",
        (next.as_str(), internship_id),
    )?;
    tracing::info!(internship = %internship_id, to = next.as_str(), "internship promoted");
    Ok(Some(next))
}

fn query_internships(
    conn: &Connection,
    where_sql: &str,
    binds: &[&dyn rusqlite::ToSql],
) -> rusqlite::Result<Vec<Value>> {
    let sql = format!(
        "{} {} ORDER BY i.start_date, s.last_name",
        INTERNSHIP_SELECT, where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(binds, |r| {
            let raw: String = r.get(12)?;
            let status = InternshipStatus::parse(&raw).unwrap_or(InternshipStatus::Pending);
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "student": full_name(&r.get::<_, String>(2)?, &r.get::<_, String>(3)?),
                "company": r.get::<_, String>(4)?,
                "project": r.get::<_, Option<String>>(5)?,
                "startDate": r.get::<_, String>(6)?,
                "endDate": r.get::<_, String>(7)?,
                "location": r.get::<_, Option<String>>(8)?,
                "industrialSupervisor": r.get::<_, Option<String>>(9)?,
                "supervisorEmail": r.get::<_, Option<String>>(10)?,
                "description": r.get::<_, Option<String>>(11)?,
                "status": status.as_str(),
                "statusLabel": status.label(),
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for row in rows.iter_mut() {
        let id = row["id"].as_str().unwrap_or_default().to_string();
        row["reportStatus"] = json!(report_status(internship_documents(conn, &id)?));
    }
    Ok(rows)
}

fn single_internship(conn: &Connection, req: &Request, id: &str) -> Result<Value, Value> {
    let mut found = query_internships(conn, "WHERE i.id = ?", &[&id])
        .map_err(db_err(req, "db_query_failed"))?;
    if found.is_empty() {
        return Err(not_found(req, "internship"));
    }
    Ok(found.remove(0))
}

fn handle_internships_create(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let company = required_str(req, "company")?;
    let start = required_date(req, "startDate")?;
    let end = required_date(req, "endDate")?;
    if end < start {
        return Err(bad_params(req, "endDate must not be before startDate"));
    }
    let status = match opt_str(req, "status")? {
        None => InternshipStatus::Pending,
        Some(raw) => match InternshipStatus::parse(&raw) {
            Some(s @ (InternshipStatus::Pending | InternshipStatus::InProgress)) => s,
            Some(other) => {
                tracing::warn!(status = other.as_str(), "initial internship status ignored");
                InternshipStatus::Pending
            }
            None => return Err(bad_params(req, "unknown status")),
        },
    };
    require_row(conn, req, "students", &student_id, "student")?;

    let id = new_id();
    let inserted = conn.execute(
        "INSERT INTO internships(id, student_id, company, project, start_date, end_date,
                                 location, industrial_supervisor, supervisor_email,
                                 description, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &student_id,
            &company,
            opt_str(req, "project")?,
            fmt_date(start),
            fmt_date(end),
            opt_str(req, "location")?,
            opt_str(req, "industrialSupervisor")?,
            opt_str(req, "supervisorEmail")?,
            opt_str(req, "description")?,
            status.as_str(),
        ),
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(err(
                &req.id,
                "conflict",
                "an internship with these dates already exists for this student",
                None,
            ));
        }
        Err(e) => {
            return Err(err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "internships" })),
            ))
        }
    }
    Ok(json!({ "internship": single_internship(conn, req, &id)? }))
}

fn handle_internships_get(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let id = required_str(req, "internshipId")?;
    Ok(json!({ "internship": single_internship(conn, req, &id)? }))
}

fn handle_internships_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "internships": [] }));
    };
    let internships = match opt_str(req, "studentId")? {
        Some(student_id) => query_internships(conn, "WHERE i.student_id = ?", &[&student_id]),
        None => query_internships(conn, "", &[]),
    }
    .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "internships": internships }))
}

fn move_to(
    conn: &Connection,
    req: &Request,
    internship_id: &str,
    to: InternshipStatus,
) -> Result<Value, Value> {
    let current = internship_status(conn, internship_id)
        .map_err(db_err(req, "db_query_failed"))?
        .ok_or_else(|| not_found(req, "internship"))?;
    let next = current
        .transition(to)
        .map_err(|e| transition_failed(req, &e))?;
    conn.execute(
        "UPDATE internships SET status = ? WHERE id = ?",
        (next.as_str(), internship_id),
    )
    .map_err(db_err(req, "db_update_failed"))?;
    if next == InternshipStatus::InProgress {
        promote_internship(conn, internship_id).map_err(db_err(req, "db_update_failed"))?;
    }
    Ok(json!({ "internship": single_internship(conn, req, internship_id)? }))
}

fn handle_internships_validate(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let id = required_str(req, "internshipId")?;
    move_to(conn, req, &id, InternshipStatus::Validated)
}

fn handle_internships_set_status(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let id = required_str(req, "internshipId")?;
    let raw = required_str(req, "status")?;
    let to = InternshipStatus::parse(&raw).ok_or_else(|| bad_params(req, "unknown status"))?;
    move_to(conn, req, &id, to)
}

fn handle_internships_stats(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let (total, pending): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(status = ?), 0) FROM internships",
            [InternshipStatus::Pending.as_str()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "total": total, "pending": pending }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "internships.create" => handle_internships_create(state, req),
        "internships.get" => handle_internships_get(state, req),
        "internships.list" => handle_internships_list(state, req),
        "internships.validate" => handle_internships_validate(state, req),
        "internships.setStatus" => handle_internships_set_status(state, req),
        "internships.stats" => handle_internships_stats(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
