use crate::ipc::error::{err, finish};
use crate::ipc::handlers::setup::assignment_settings;
use crate::ipc::helpers::{
    bad_params, db_conn, db_err, fmt_date, full_name, new_id, not_found, opt_date, opt_i64_range,
    opt_str, require_row, required_str, today, transition_failed,
};
use crate::ipc::types::{AppState, Request};
use crate::workflow::ProposalStatus;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

const PROJECT_SELECT: &str = "SELECT p.id, p.title, p.description, p.domain, p.difficulty,
            p.proposed_on, p.status, p.proposed_by_student, p.proposer_student_id,
            p.supervisor_id, p.capacity, p.rejection_reason, t.first_name, t.last_name,
            (SELECT a.id FROM assignments a WHERE a.project_id = p.id)
     FROM projects p
     LEFT JOIN teachers t ON t.id = p.supervisor_id";

fn load_technologies(conn: &Connection, project_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM project_technologies WHERE project_id = ? ORDER BY position",
    )?;
    let names = stmt
        .query_map([project_id], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

fn query_projects(
    conn: &Connection,
    where_sql: &str,
    binds: &[&dyn rusqlite::ToSql],
) -> rusqlite::Result<Vec<Value>> {
    let sql = format!(
        "{} {} ORDER BY p.proposed_on, p.rowid",
        PROJECT_SELECT, where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut projects = stmt
        .query_map(binds, |r| {
            let status_raw: String = r.get(6)?;
            let status = ProposalStatus::parse(&status_raw).unwrap_or(ProposalStatus::Pending);
            let sup_first: Option<String> = r.get(12)?;
            let sup_last: Option<String> = r.get(13)?;
            let supervisor_name = match (sup_first, sup_last) {
                (Some(f), Some(l)) => Some(full_name(&f, &l)),
                _ => None,
            };
            let assignment_id: Option<String> = r.get(14)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "domain": r.get::<_, Option<String>>(3)?,
                "difficulty": r.get::<_, Option<String>>(4)?,
                "proposedOn": r.get::<_, String>(5)?,
                "status": status.as_str(),
                "statusLabel": status.label(),
                "proposedByStudent": r.get::<_, i64>(7)? != 0,
                "proposerStudentId": r.get::<_, Option<String>>(8)?,
                "supervisorId": r.get::<_, Option<String>>(9)?,
                "supervisorName": supervisor_name,
                "capacity": r.get::<_, i64>(10)?,
                "rejectionReason": r.get::<_, Option<String>>(11)?,
                "assigned": assignment_id.is_some(),
                "assignmentId": assignment_id,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for p in projects.iter_mut() {
        let id = p["id"].as_str().unwrap_or_default().to_string();
        p["technologies"] = json!(load_technologies(conn, &id)?);
    }
    Ok(projects)
}

pub fn project_status(conn: &Connection, project_id: &str) -> rusqlite::Result<Option<ProposalStatus>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM projects WHERE id = ?",
            [project_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| ProposalStatus::parse(&s)))
}

fn parse_technologies(req: &Request) -> Result<Vec<String>, Value> {
    match req.params.get("technologies") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => {
            let mut out: Vec<String> = Vec::new();
            for item in items {
                let name = item
                    .as_str()
                    .ok_or_else(|| bad_params(req, "technologies must be an array of strings"))?
                    .trim();
                if !name.is_empty() && !out.iter().any(|t| t.eq_ignore_ascii_case(name)) {
                    out.push(name.to_string());
                }
            }
            Ok(out)
        }
        Some(_) => Err(bad_params(req, "technologies must be an array of strings")),
    }
}

struct NewProject {
    title: String,
    description: Option<String>,
    domain: Option<String>,
    difficulty: Option<String>,
    technologies: Vec<String>,
    proposed_on: String,
    proposer_student_id: Option<String>,
    supervisor_id: Option<String>,
    capacity: i64,
}

fn read_new_project(req: &Request) -> Result<NewProject, Value> {
    Ok(NewProject {
        title: required_str(req, "title")?,
        description: opt_str(req, "description")?,
        domain: opt_str(req, "domain")?,
        difficulty: opt_str(req, "difficulty")?,
        technologies: parse_technologies(req)?,
        proposed_on: fmt_date(opt_date(req, "proposedOn")?.unwrap_or_else(today)),
        proposer_student_id: None,
        supervisor_id: None,
        capacity: opt_i64_range(req, &req.params, "capacity", 1, 2)?.unwrap_or(1),
    })
}

fn insert_project(tx: &Connection, p: &NewProject) -> rusqlite::Result<String> {
    let id = new_id();
    tx.execute(
        "INSERT INTO projects(id, title, description, domain, difficulty, proposed_on, status,
                              proposed_by_student, proposer_student_id, supervisor_id, capacity)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &p.title,
            &p.description,
            &p.domain,
            &p.difficulty,
            &p.proposed_on,
            ProposalStatus::Pending.as_str(),
            p.proposer_student_id.is_some() as i64,
            &p.proposer_student_id,
            &p.supervisor_id,
            p.capacity,
        ),
    )?;
    for (i, name) in p.technologies.iter().enumerate() {
        tx.execute(
            "INSERT INTO project_technologies(project_id, position, name) VALUES(?, ?, ?)",
            (&id, i as i64, name),
        )?;
    }
    Ok(id)
}

fn single_project(conn: &Connection, req: &Request, project_id: &str) -> Result<Value, Value> {
    let mut found = query_projects(conn, "WHERE p.id = ?", &[&project_id])
        .map_err(db_err(req, "db_query_failed"))?;
    if found.is_empty() {
        return Err(not_found(req, "project"));
    }
    Ok(found.remove(0))
}

fn handle_propose_by_teacher(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let teacher_id = required_str(req, "teacherId")?;
    require_row(conn, req, "teachers", &teacher_id, "teacher")?;
    let mut project = read_new_project(req)?;
    project.supervisor_id = Some(teacher_id);

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err(req, "db_tx_failed"))?;
    let id = insert_project(&tx, &project).map_err(db_err(req, "db_insert_failed"))?;
    tx.commit().map_err(db_err(req, "db_tx_failed"))?;
    tracing::info!(project = %id, "project proposed by teacher");
    Ok(json!({ "project": single_project(conn, req, &id)? }))
}

fn handle_propose_by_student(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    require_row(conn, req, "students", &student_id, "student")?;
    let partner_id = opt_str(req, "partnerId")?;
    if let Some(partner) = partner_id.as_deref() {
        if !assignment_settings(conn).allow_pairs {
            return Err(bad_params(req, "pair work is disabled"));
        }
        if partner == student_id {
            return Err(bad_params(req, "partnerId must differ from studentId"));
        }
        require_row(conn, req, "students", partner, "partner")?;
    }
    let supervisor_id = opt_str(req, "supervisorId")?;
    if let Some(sup) = supervisor_id.as_deref() {
        require_row(conn, req, "teachers", sup, "teacher")?;
    }

    let mut project = read_new_project(req)?;
    project.proposer_student_id = Some(student_id.clone());
    project.supervisor_id = supervisor_id;
    if partner_id.is_some() {
        project.capacity = 2;
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err(req, "db_tx_failed"))?;
    let id = insert_project(&tx, &project).map_err(db_err(req, "db_insert_failed"))?;
    tx.execute(
        "INSERT INTO choices(id, student_id, project_id, preference, partner_id, proposed)
         VALUES(?, ?, ?, 1, ?, 1)",
        (new_id(), &student_id, &id, &partner_id),
    )
    .map_err(db_err(req, "db_insert_failed"))?;
    tx.commit().map_err(db_err(req, "db_tx_failed"))?;
    tracing::info!(project = %id, student = %student_id, "project proposed by student");
    Ok(json!({ "project": single_project(conn, req, &id)? }))
}

fn decide(req: &Request, conn: &Connection, to: ProposalStatus) -> Result<Value, Value> {
    let project_id = required_str(req, "projectId")?;
    let current = project_status(conn, &project_id)
        .map_err(db_err(req, "db_query_failed"))?
        .ok_or_else(|| not_found(req, "project"))?;
    let next = current
        .transition("project", to)
        .map_err(|e| transition_failed(req, &e))?;

    match next {
        ProposalStatus::Validated => {
            let supervisor_id = opt_str(req, "supervisorId")?;
            if let Some(sup) = supervisor_id.as_deref() {
                require_row(conn, req, "teachers", sup, "teacher")?;
            }
            conn.execute(
                "UPDATE projects SET status = ?, supervisor_id = COALESCE(?, supervisor_id)
                 WHERE id = ?",
                (next.as_str(), &supervisor_id, &project_id),
            )
            .map_err(db_err(req, "db_update_failed"))?;
        }
        _ => {
            let reason = opt_str(req, "reason")?;
            conn.execute(
                "UPDATE projects SET status = ?, rejection_reason = ? WHERE id = ?",
                (next.as_str(), &reason, &project_id),
            )
            .map_err(db_err(req, "db_update_failed"))?;
        }
    }
    tracing::info!(project = %project_id, from = current.as_str(), to = next.as_str(), "project reviewed");
    Ok(json!({ "project": single_project(conn, req, &project_id)? }))
}

fn handle_projects_validate(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    decide(req, conn, ProposalStatus::Validated)
}

fn handle_projects_reject(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    decide(req, conn, ProposalStatus::Rejected)
}

fn handle_projects_delete(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let project_id = required_str(req, "projectId")?;
    require_row(conn, req, "projects", &project_id, "project")?;
    let assigned: Option<String> = conn
        .query_row(
            "SELECT id FROM assignments WHERE project_id = ?",
            [&project_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err(req, "db_query_failed"))?;
    if assigned.is_some() {
        return Err(err(
            &req.id,
            "conflict",
            "project is assigned; delete the assignment first",
            None,
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err(req, "db_tx_failed"))?;
    let steps: [(&str, &str); 5] = [
        ("choices", "DELETE FROM choices WHERE project_id = ?"),
        ("feedback", "DELETE FROM feedback WHERE project_id = ?"),
        ("meetings", "DELETE FROM meetings WHERE project_id = ?"),
        (
            "project_technologies",
            "DELETE FROM project_technologies WHERE project_id = ?",
        ),
        ("projects", "DELETE FROM projects WHERE id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&project_id]) {
            let _ = tx.rollback();
            return Err(err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            ));
        }
    }
    tx.commit().map_err(db_err(req, "db_tx_failed"))?;
    Ok(json!({ "ok": true }))
}

fn list_by_status(
    state: &mut AppState,
    req: &Request,
    status: Option<ProposalStatus>,
) -> Result<Value, Value> {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "projects": [] }));
    };
    let projects = match status {
        Some(s) => query_projects(conn, "WHERE p.status = ?", &[&s.as_str()]),
        None => query_projects(conn, "", &[]),
    }
    .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "projects": projects }))
}

fn handle_projects_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<SqlValue> = Vec::new();
    if let Some(raw) = opt_str(req, "status")? {
        let status = ProposalStatus::parse(&raw).ok_or_else(|| bad_params(req, "unknown status"))?;
        clauses.push("p.status = ?");
        binds.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(sup) = opt_str(req, "supervisorId")? {
        clauses.push("p.supervisor_id = ?");
        binds.push(SqlValue::Text(sup));
    }
    if let Some(student) = opt_str(req, "proposerStudentId")? {
        clauses.push("p.proposer_student_id = ?");
        binds.push(SqlValue::Text(student));
    }
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "projects": [] }));
    };
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let refs: Vec<&dyn rusqlite::ToSql> = binds.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
    let projects =
        query_projects(conn, &where_sql, &refs).map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "projects": projects }))
}

fn handle_projects_available(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let projects = query_projects(
        conn,
        "WHERE p.status = ? AND NOT EXISTS (SELECT 1 FROM assignments a WHERE a.project_id = p.id)",
        &[&ProposalStatus::Validated.as_str()],
    )
    .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "projects": projects }))
}

fn handle_projects_get(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let project_id = required_str(req, "projectId")?;
    Ok(json!({ "project": single_project(conn, req, &project_id)? }))
}

fn handle_projects_stats(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let fail = db_err(req, "db_query_failed");
    let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };
    let by_status = |s: ProposalStatus| -> rusqlite::Result<i64> {
        conn.query_row(
            "SELECT COUNT(*) FROM projects WHERE status = ?",
            [s.as_str()],
            |r| r.get(0),
        )
    };
    Ok(json!({
        "total": count("SELECT COUNT(*) FROM projects").map_err(&fail)?,
        "validated": by_status(ProposalStatus::Validated).map_err(&fail)?,
        "pending": by_status(ProposalStatus::Pending).map_err(&fail)?,
        "rejected": by_status(ProposalStatus::Rejected).map_err(&fail)?,
        "supervisors": count(
            "SELECT COUNT(DISTINCT supervisor_id) FROM projects WHERE supervisor_id IS NOT NULL"
        )
        .map_err(&fail)?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "projects.proposeByTeacher" => handle_propose_by_teacher(state, req),
        "projects.proposeByStudent" => handle_propose_by_student(state, req),
        "projects.validate" => handle_projects_validate(state, req),
        "projects.reject" => handle_projects_reject(state, req),
        "projects.delete" => handle_projects_delete(state, req),
        "projects.list" => handle_projects_list(state, req),
        "projects.pending" => list_by_status(state, req, Some(ProposalStatus::Pending)),
        "projects.validated" => list_by_status(state, req, Some(ProposalStatus::Validated)),
        "projects.rejected" => list_by_status(state, req, Some(ProposalStatus::Rejected)),
        "projects.available" => handle_projects_available(state, req),
        "projects.get" => handle_projects_get(state, req),
        "projects.stats" => handle_projects_stats(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
