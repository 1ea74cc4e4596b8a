use crate::credentials::{hash_password, normalize_email};
use crate::ipc::error::{err, finish};
use crate::ipc::helpers::{
    db_conn, db_err, full_name, is_unique_violation, new_id, not_found, opt_str, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::workflow::ProposalStatus;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const TEACHER_SELECT: &str =
    "SELECT id, first_name, last_name, email, department, position, office FROM teachers";

fn teacher_row(r: &Row) -> rusqlite::Result<Value> {
    let first: String = r.get(1)?;
    let last: String = r.get(2)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "firstName": first,
        "lastName": last,
        "fullName": full_name(&first, &last),
        "email": r.get::<_, String>(3)?,
        "department": r.get::<_, Option<String>>(4)?,
        "position": r.get::<_, Option<String>>(5)?,
        "office": r.get::<_, Option<String>>(6)?,
    }))
}

/// Students placed under this teacher by assignments (pairs count twice).
pub fn supervised_student_count(conn: &Connection, teacher_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(SUM(1 + (student2_id IS NOT NULL)), 0)
         FROM assignments WHERE supervisor_id = ?",
        [teacher_id],
        |r| r.get(0),
    )
}

fn insert_person(
    conn: &Connection,
    req: &Request,
    table: &str,
    extra_cols: &[&str],
    extra_vals: Vec<Option<String>>,
) -> Result<String, Value> {
    let first = required_str(req, "firstName")?;
    let last = required_str(req, "lastName")?;
    let email = normalize_email(&required_str(req, "email")?);
    let password = opt_str(req, "password")?;

    let id = new_id();
    let mut cols = vec!["id", "first_name", "last_name", "email", "password_hash"];
    cols.extend_from_slice(extra_cols);
    let marks = vec!["?"; cols.len()].join(", ");
    let sql = format!(
        "INSERT INTO {}({}) VALUES({})",
        table,
        cols.join(", "),
        marks
    );
    let mut values: Vec<Option<String>> = vec![
        Some(id.clone()),
        Some(first),
        Some(last),
        Some(email),
        password.as_deref().map(hash_password),
    ];
    values.extend(extra_vals);

    match conn.execute(&sql, rusqlite::params_from_iter(values)) {
        Ok(_) => Ok(id),
        Err(e) if is_unique_violation(&e) => {
            Err(err(&req.id, "conflict", "email already in use", None))
        }
        Err(e) => Err(err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": table })),
        )),
    }
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let extra = vec![
        opt_str(req, "department")?,
        opt_str(req, "position")?,
        opt_str(req, "office")?,
    ];
    let id = insert_person(conn, req, "teachers", &["department", "position", "office"], extra)?;
    Ok(json!({ "teacherId": id }))
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "teachers": [] }));
    };
    let mut stmt = conn
        .prepare(&format!("{} ORDER BY last_name, first_name", TEACHER_SELECT))
        .map_err(db_err(req, "db_query_failed"))?;
    let teachers = stmt
        .query_map([], teacher_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "teachers": teachers }))
}

fn handle_teachers_profile(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let teacher_id = required_str(req, "teacherId")?;
    let fail = db_err(req, "db_query_failed");
    let teacher = conn
        .query_row(&format!("{} WHERE id = ?", TEACHER_SELECT), [&teacher_id], teacher_row)
        .optional()
        .map_err(&fail)?;
    let Some(mut teacher) = teacher else {
        return Err(not_found(req, "teacher"));
    };
    teacher["supervisedStudentCount"] =
        json!(supervised_student_count(conn, &teacher_id).map_err(&fail)?);
    Ok(json!({ "teacher": teacher }))
}

fn handle_teachers_stats(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let teacher_id = required_str(req, "teacherId")?;
    let fail = db_err(req, "db_query_failed");
    let count_status = |status: Option<ProposalStatus>| -> rusqlite::Result<i64> {
        match status {
            Some(s) => conn.query_row(
                "SELECT COUNT(*) FROM projects WHERE supervisor_id = ? AND status = ?",
                (&teacher_id, s.as_str()),
                |r| r.get(0),
            ),
            None => conn.query_row(
                "SELECT COUNT(*) FROM projects WHERE supervisor_id = ?",
                [&teacher_id],
                |r| r.get(0),
            ),
        }
    };
    let proposed = count_status(None).map_err(&fail)?;
    let pending = count_status(Some(ProposalStatus::Pending)).map_err(&fail)?;
    let validated = count_status(Some(ProposalStatus::Validated)).map_err(&fail)?;
    let supervised_projects: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM assignments WHERE supervisor_id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .map_err(&fail)?;
    let supervised_students = supervised_student_count(conn, &teacher_id).map_err(&fail)?;
    Ok(json!({
        "proposed": proposed,
        "pending": pending,
        "validated": validated,
        "supervisedProjects": supervised_projects,
        "supervisedStudents": supervised_students,
    }))
}

fn handle_admins_create(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let extra = vec![opt_str(req, "department")?, opt_str(req, "academicYear")?];
    let id = insert_person(
        conn,
        req,
        "administrators",
        &["department", "academic_year"],
        extra,
    )?;
    Ok(json!({ "adminId": id }))
}

fn handle_admins_get(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let admin_id = required_str(req, "adminId")?;
    let admin = conn
        .query_row(
            "SELECT id, first_name, last_name, email, department, academic_year
             FROM administrators WHERE id = ?",
            [&admin_id],
            |r| {
                let first: String = r.get(1)?;
                let last: String = r.get(2)?;
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "firstName": first,
                    "lastName": last,
                    "fullName": full_name(&first, &last),
                    "email": r.get::<_, String>(3)?,
                    "department": r.get::<_, Option<String>>(4)?,
                    "academicYear": r.get::<_, Option<String>>(5)?,
                }))
            },
        )
        .optional()
        .map_err(db_err(req, "db_query_failed"))?;
    match admin {
        Some(a) => Ok(json!({ "admin": a })),
        None => Err(not_found(req, "administrator")),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "teachers.create" => handle_teachers_create(state, req),
        "teachers.list" => handle_teachers_list(state, req),
        "teachers.profile" => handle_teachers_profile(state, req),
        "teachers.stats" => handle_teachers_stats(state, req),
        "admins.create" => handle_admins_create(state, req),
        "admins.get" => handle_admins_get(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
