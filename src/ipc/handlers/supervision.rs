use crate::ipc::error::{err, finish};
use crate::ipc::handlers::setup::assignment_settings;
use crate::ipc::helpers::{
    bad_params, db_conn, db_err, fmt_date, full_name, new_id, opt_date, opt_str, require_row,
    required_date, required_str, today,
};
use crate::ipc::types::{AppState, Request};
use chrono::{Months, NaiveDate};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

const NOTES_MAX: usize = 1000;

/// Last day of supervision for a start date.
pub fn supervision_end(start: NaiveDate, months: u32) -> NaiveDate {
    start.checked_add_months(Months::new(months)).unwrap_or(start)
}

fn display_date(iso: &str) -> String {
    NaiveDate::parse_from_str(iso, "%Y-%m-%d")
        .map(|d| d.format("%d/%m/%Y").to_string())
        .unwrap_or_else(|_| iso.to_string())
}

fn end_date_for(assigned_on: &str, months: u32) -> String {
    NaiveDate::parse_from_str(assigned_on, "%Y-%m-%d")
        .map(|d| fmt_date(supervision_end(d, months)))
        .unwrap_or_default()
}

fn supervises(conn: &Connection, teacher_id: &str, project_id: &str) -> rusqlite::Result<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM projects p
             WHERE p.id = ?2
               AND (p.supervisor_id = ?1
                    OR EXISTS (SELECT 1 FROM assignments a
                               WHERE a.project_id = p.id AND a.supervisor_id = ?1))",
            [teacher_id, project_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn require_supervisor(
    conn: &Connection,
    req: &Request,
    teacher_id: &str,
    project_id: &str,
) -> Result<(), Value> {
    require_row(conn, req, "teachers", teacher_id, "teacher")?;
    require_row(conn, req, "projects", project_id, "project")?;
    match supervises(conn, teacher_id, project_id) {
        Ok(true) => Ok(()),
        Ok(false) => Err(err(
            &req.id,
            "unauthorized",
            "teacher does not supervise this project",
            None,
        )),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn handle_supervised_projects(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let teacher_id = required_str(req, "teacherId")?;
    require_row(conn, req, "teachers", &teacher_id, "teacher")?;
    let months = assignment_settings(conn).supervision_months;

    let mut stmt = conn
        .prepare(
            "SELECT a.project_id, p.title, s1.first_name, s1.last_name, s2.first_name,
                    s2.last_name, a.assigned_on
             FROM assignments a
             JOIN projects p ON p.id = a.project_id
             JOIN students s1 ON s1.id = a.student1_id
             LEFT JOIN students s2 ON s2.id = a.student2_id
             WHERE a.supervisor_id = ?
             ORDER BY a.assigned_on, p.title",
        )
        .map_err(db_err(req, "db_query_failed"))?;
    let rows = stmt
        .query_map([&teacher_id], |r| {
            let s1_first: String = r.get(2)?;
            let s1_last: String = r.get(3)?;
            let s2_first: Option<String> = r.get(4)?;
            let s2_last: Option<String> = r.get(5)?;
            let mut students = vec![format!("{} {}", s1_last, s1_first)];
            if let (Some(f), Some(l)) = (s2_first, s2_last) {
                students.push(format!("{} {}", l, f));
            }
            let start: String = r.get(6)?;
            Ok(json!({
                "projectId": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "students": students.join(" and "),
                "startDate": start,
                "endDate": end_date_for(&start, months),
                "progress": 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "projects": rows }))
}

fn handle_projects_supervised(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let months = assignment_settings(conn).supervision_months;
    let teacher_id = opt_str(req, "teacherId")?;

    let mut stmt = conn
        .prepare(
            "SELECT a.project_id, p.title, s.first_name, s.last_name, a.assigned_on,
                    a.supervisor_id
             FROM assignments a
             JOIN projects p ON p.id = a.project_id
             JOIN students s ON s.id = a.student1_id OR s.id = a.student2_id
             WHERE ?1 IS NULL OR a.supervisor_id = ?1
             ORDER BY a.assigned_on, p.title, s.last_name",
        )
        .map_err(db_err(req, "db_query_failed"))?;
    let rows = stmt
        .query_map([&teacher_id], |r| {
            let start: String = r.get(4)?;
            Ok(json!({
                "projectId": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "student": full_name(&r.get::<_, String>(2)?, &r.get::<_, String>(3)?),
                "supervisorId": r.get::<_, Option<String>>(5)?,
                "startDate": start,
                "endDate": end_date_for(&start, months),
                "progress": 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "projects": rows }))
}

fn handle_feedback_send(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let teacher_id = required_str(req, "teacherId")?;
    let project_id = required_str(req, "projectId")?;
    let message = required_str(req, "message")?;
    let date = opt_date(req, "date")?.unwrap_or_else(today);
    require_supervisor(conn, req, &teacher_id, &project_id)?;

    let id = new_id();
    conn.execute(
        "INSERT INTO feedback(id, teacher_id, project_id, message, date) VALUES(?, ?, ?, ?, ?)",
        (&id, &teacher_id, &project_id, &message, fmt_date(date)),
    )
    .map_err(db_err(req, "db_insert_failed"))?;
    Ok(json!({ "feedbackId": id }))
}

fn handle_feedback_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let project_id = required_str(req, "projectId")?;
    let mut stmt = conn
        .prepare(
            "SELECT f.id, f.teacher_id, t.first_name, t.last_name, f.message, f.date
             FROM feedback f
             JOIN teachers t ON t.id = f.teacher_id
             WHERE f.project_id = ?
             ORDER BY f.date, f.rowid",
        )
        .map_err(db_err(req, "db_query_failed"))?;
    let feedback = stmt
        .query_map([&project_id], |r| {
            let iso: String = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "teacherId": r.get::<_, String>(1)?,
                "teacher": full_name(&r.get::<_, String>(2)?, &r.get::<_, String>(3)?),
                "message": r.get::<_, String>(4)?,
                "date": display_date(&iso),
                "isoDate": iso,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "feedback": feedback }))
}

fn handle_meetings_schedule(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let teacher_id = required_str(req, "teacherId")?;
    let project_id = required_str(req, "projectId")?;
    let date = required_date(req, "date")?;
    let notes = required_str(req, "notes")?;
    if notes.chars().count() > NOTES_MAX {
        return Err(bad_params(
            req,
            format!("notes length must be <= {}", NOTES_MAX),
        ));
    }
    require_supervisor(conn, req, &teacher_id, &project_id)?;

    let id = new_id();
    conn.execute(
        "INSERT INTO meetings(id, teacher_id, project_id, date, notes) VALUES(?, ?, ?, ?, ?)",
        (&id, &teacher_id, &project_id, fmt_date(date), &notes),
    )
    .map_err(db_err(req, "db_insert_failed"))?;
    tracing::info!(project = %project_id, date = %date, "meeting scheduled");
    Ok(json!({ "meetingId": id }))
}

fn handle_meetings_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let project_id = required_str(req, "projectId")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, teacher_id, date, notes FROM meetings
             WHERE project_id = ?
             ORDER BY date, rowid",
        )
        .map_err(db_err(req, "db_query_failed"))?;
    let meetings = stmt
        .query_map([&project_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "teacherId": r.get::<_, String>(1)?,
                "date": r.get::<_, String>(2)?,
                "notes": r.get::<_, String>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "meetings": meetings }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "teachers.supervisedProjects" => handle_supervised_projects(state, req),
        "projects.supervised" => handle_projects_supervised(state, req),
        "feedback.send" => handle_feedback_send(state, req),
        "feedback.list" => handle_feedback_list(state, req),
        "meetings.schedule" => handle_meetings_schedule(state, req),
        "meetings.list" => handle_meetings_list(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervision_end_adds_calendar_months() {
        let start = NaiveDate::from_ymd_opt(2025, 2, 10).unwrap();
        assert_eq!(
            supervision_end(start, 6),
            NaiveDate::from_ymd_opt(2025, 8, 10).unwrap()
        );
        let month_end = NaiveDate::from_ymd_opt(2025, 8, 31).unwrap();
        assert_eq!(
            supervision_end(month_end, 6),
            NaiveDate::from_ymd_opt(2026, 2, 28).unwrap()
        );
    }

    #[test]
    fn feedback_dates_display_day_first() {
        assert_eq!(display_date("2025-03-07"), "07/03/2025");
        assert_eq!(display_date("garbage"), "garbage");
    }
}
