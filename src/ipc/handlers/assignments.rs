use crate::assign::{self, Choice, Options, Plan, ProjectSlot, StudentMerit, Taken};
use crate::ipc::error::{err, finish};
use crate::ipc::handlers::setup::{assignment_settings, notification_settings};
use crate::ipc::handlers::teachers::supervised_student_count;
use crate::ipc::helpers::{
    db_conn, db_err, fmt_date, full_name, new_id, not_found, require_row, required_str, today,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::{self, Event, UNASSIGNED};
use crate::workflow::ProposalStatus;
use rusqlite::{Connection, Row};
use serde_json::{json, Value};

const ASSIGNMENT_SELECT: &str = "SELECT a.id, a.project_id, p.title, a.student1_id,
            s1.first_name, s1.last_name, a.student2_id, s2.first_name, s2.last_name,
            a.supervisor_id, t.first_name, t.last_name, a.assigned_on, a.source
     FROM assignments a
     JOIN projects p ON p.id = a.project_id
     JOIN students s1 ON s1.id = a.student1_id
     LEFT JOIN students s2 ON s2.id = a.student2_id
     LEFT JOIN teachers t ON t.id = a.supervisor_id";

fn joined_name(first: Option<String>, last: Option<String>) -> Option<String> {
    match (first, last) {
        (Some(f), Some(l)) => Some(full_name(&f, &l)),
        _ => None,
    }
}

fn assignment_row(r: &Row) -> rusqlite::Result<Value> {
    let student1 = full_name(&r.get::<_, String>(4)?, &r.get::<_, String>(5)?);
    let student2 = joined_name(r.get(7)?, r.get(8)?);
    let supervisor = joined_name(r.get(10)?, r.get(11)?).unwrap_or_else(|| UNASSIGNED.into());
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "projectId": r.get::<_, String>(1)?,
        "project": r.get::<_, String>(2)?,
        "student1Id": r.get::<_, String>(3)?,
        "student1": student1,
        "student2Id": r.get::<_, Option<String>>(6)?,
        "student2": student2,
        "supervisorId": r.get::<_, Option<String>>(9)?,
        "supervisor": supervisor,
        "assignedOn": r.get::<_, String>(12)?,
        "source": r.get::<_, String>(13)?,
    }))
}

fn query_assignments(
    conn: &Connection,
    where_sql: &str,
    binds: &[&dyn rusqlite::ToSql],
) -> rusqlite::Result<Vec<Value>> {
    let sql = format!(
        "{} {} ORDER BY a.assigned_on, p.title",
        ASSIGNMENT_SELECT, where_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(binds, assignment_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_students(conn: &Connection) -> rusqlite::Result<Vec<StudentMerit>> {
    let mut stmt = conn.prepare("SELECT id, average, merit_rank FROM students")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(StudentMerit {
                id: r.get(0)?,
                average: r.get(1)?,
                merit_rank: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_projects(conn: &Connection) -> rusqlite::Result<Vec<ProjectSlot>> {
    let mut stmt = conn.prepare(
        "SELECT id, status, supervisor_id, capacity FROM projects ORDER BY proposed_on, rowid",
    )?;
    let rows = stmt
        .query_map([], |r| {
            let status: String = r.get(1)?;
            let capacity: i64 = r.get(3)?;
            Ok(ProjectSlot {
                id: r.get(0)?,
                status: ProposalStatus::parse(&status).unwrap_or(ProposalStatus::Pending),
                supervisor_id: r.get(2)?,
                capacity: capacity.max(1) as usize,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_choices(conn: &Connection) -> rusqlite::Result<Vec<Choice>> {
    let mut stmt = conn.prepare(
        "SELECT student_id, project_id, preference, partner_id, proposed FROM choices",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Choice {
                student_id: r.get(0)?,
                project_id: r.get(1)?,
                preference: r.get(2)?,
                partner_id: r.get(3)?,
                proposed: r.get::<_, i64>(4)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_taken(conn: &Connection) -> rusqlite::Result<Taken> {
    let mut taken = Taken::default();
    let mut stmt = conn
        .prepare("SELECT project_id, student1_id, student2_id, supervisor_id FROM assignments")?;
    let mut rows = stmt.query([])?;
    while let Some(r) = rows.next()? {
        let project_id: String = r.get(0)?;
        let student1: String = r.get(1)?;
        let student2: Option<String> = r.get(2)?;
        let supervisor: Option<String> = r.get(3)?;
        let group = 1 + usize::from(student2.is_some());
        taken.projects.insert(project_id);
        taken.students.insert(student1);
        if let Some(s2) = student2 {
            taken.students.insert(s2);
        }
        if let Some(sup) = supervisor {
            *taken.supervisor_load.entry(sup).or_insert(0) += group;
        }
    }
    Ok(taken)
}

fn apply_plan(
    conn: &Connection,
    plan: &Plan,
    mail_signature: Option<&str>,
) -> rusqlite::Result<Vec<String>> {
    let assigned_on = fmt_date(today());
    let mut created = Vec::with_capacity(plan.assignments.len());
    for planned in &plan.assignments {
        let id = new_id();
        conn.execute(
            "INSERT INTO assignments(id, project_id, student1_id, student2_id, supervisor_id,
                                     assigned_on, source)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                &planned.project_id,
                &planned.student_id,
                &planned.partner_id,
                &planned.supervisor_id,
                &assigned_on,
                planned.source.as_str(),
            ),
        )?;
        conn.execute(
            "UPDATE students SET supervisor_id = ?1 WHERE id = ?2 OR id = ?3",
            (&planned.supervisor_id, &planned.student_id, &planned.partner_id),
        )?;
        if let Some(parties) = notify::load_parties(conn, &id)? {
            notify::record(conn, Event::Assigned, &parties, mail_signature)?;
        }
        created.push(id);
    }
    Ok(created)
}

fn handle_assignments_auto(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let settings = assignment_settings(conn);
    let notif = notification_settings(conn);
    let signature = notif.email_enabled.then_some(notif.signature.as_str());

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err(req, "db_tx_failed"))?;
    let inputs = load_students(&tx).and_then(|students| {
        Ok((students, load_projects(&tx)?, load_choices(&tx)?, load_taken(&tx)?))
    });
    let (students, projects, choices, taken) = match inputs {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return Err(err(&req.id, "db_query_failed", e.to_string(), None));
        }
    };
    let plan = assign::plan(
        &students,
        &projects,
        &choices,
        &taken,
        Options {
            strategy: settings.strategy,
            supervisor_capacity: settings.supervisor_capacity,
        },
    );
    let created = match apply_plan(&tx, &plan, signature) {
        Ok(ids) => ids,
        Err(e) => {
            let _ = tx.rollback();
            return Err(err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "assignments" })),
            ));
        }
    };
    tx.commit().map_err(db_err(req, "db_tx_failed"))?;

    let mut assignments = Vec::with_capacity(created.len());
    for id in &created {
        let rows = query_assignments(conn, "WHERE a.id = ?", &[id])
            .map_err(db_err(req, "db_query_failed"))?;
        assignments.extend(rows);
    }
    let skipped: Vec<Value> = plan
        .skipped
        .iter()
        .map(|s| {
            json!({
                "studentId": s.student_id,
                "projectId": s.project_id,
                "reason": s.reason.as_str(),
            })
        })
        .collect();
    let message = if created.is_empty() {
        "No new assignment could be made".to_string()
    } else {
        format!("{} assignment(s) created", created.len())
    };
    tracing::info!(
        strategy = settings.strategy.as_str(),
        created = created.len(),
        skipped = skipped.len(),
        "automatic assignment finished"
    );
    Ok(json!({
        "created": created.len(),
        "assignments": assignments,
        "skipped": skipped,
        "message": message,
    }))
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "assignments": [] }));
    };
    let assignments =
        query_assignments(conn, "", &[]).map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "assignments": assignments }))
}

fn handle_assignments_for_student(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    require_row(conn, req, "students", &student_id, "student")?;
    let mut found = query_assignments(
        conn,
        "WHERE a.student1_id = ?1 OR a.student2_id = ?1",
        &[&student_id],
    )
    .map_err(db_err(req, "db_query_failed"))?;
    if found.is_empty() {
        return Err(not_found(req, "assignment"));
    }
    Ok(json!({ "assignment": found.remove(0) }))
}

fn handle_assignments_delete(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let assignment_id = required_str(req, "assignmentId")?;
    let parties = notify::load_parties(conn, &assignment_id)
        .map_err(db_err(req, "db_query_failed"))?
        .ok_or_else(|| not_found(req, "assignment"))?;
    let notif = notification_settings(conn);
    let signature = notif.email_enabled.then_some(notif.signature.as_str());

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err(req, "db_tx_failed"))?;
    let partner_id = parties.partner.as_ref().map(|p| p.id.clone());
    let applied = tx
        .execute("DELETE FROM assignments WHERE id = ?", [&assignment_id])
        .and_then(|_| {
            tx.execute(
                "UPDATE students SET supervisor_id = NULL WHERE id = ?1 OR id = ?2",
                (&parties.student.id, &partner_id),
            )
        })
        .and_then(|_| notify::record(&tx, Event::Cancelled, &parties, signature));
    if let Err(e) = applied {
        let _ = tx.rollback();
        return Err(err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        ));
    }
    tx.commit().map_err(db_err(req, "db_tx_failed"))?;
    tracing::info!(assignment = %assignment_id, project = %parties.project_id, "assignment deleted");
    Ok(json!({ "ok": true }))
}

fn handle_assignments_student_count(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let teacher_id = required_str(req, "teacherId")?;
    let count =
        supervised_student_count(conn, &teacher_id).map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "count": count }))
}

fn handle_assignments_supervisor_count(
    state: &mut AppState,
    req: &Request,
) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(DISTINCT supervisor_id) FROM assignments WHERE supervisor_id IS NOT NULL",
            [],
            |r| r.get(0),
        )
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "count": count }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "assignments.auto" => handle_assignments_auto(state, req),
        "assignments.list" => handle_assignments_list(state, req),
        "assignments.forStudent" => handle_assignments_for_student(state, req),
        "assignments.delete" => handle_assignments_delete(state, req),
        "assignments.studentCount" => handle_assignments_student_count(state, req),
        "assignments.supervisorCount" => handle_assignments_supervisor_count(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
