use crate::credentials::{hash_password, normalize_email};
use crate::ipc::error::{err, finish};
use crate::ipc::helpers::{
    bad_params, db_conn, db_err, full_name, is_unique_violation, new_id, not_found, opt_f64_range,
    opt_i64_range, opt_str, opt_str_in, require_row, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, OptionalExtension, Row};
use serde_json::{json, Value};
use std::path::PathBuf;

pub const AVERAGE_MAX: f64 = 20.0;

const STUDENT_SELECT: &str = "SELECT s.id, s.first_name, s.last_name, s.email, s.section,
            s.group_name, s.average, s.merit_rank, s.supervisor_id, t.first_name, t.last_name
     FROM students s
     LEFT JOIN teachers t ON t.id = s.supervisor_id";

fn student_row(r: &Row) -> rusqlite::Result<Value> {
    let id: String = r.get(0)?;
    let first: String = r.get(1)?;
    let last: String = r.get(2)?;
    let email: String = r.get(3)?;
    let section: Option<String> = r.get(4)?;
    let group: Option<String> = r.get(5)?;
    let average: Option<f64> = r.get(6)?;
    let merit_rank: Option<i64> = r.get(7)?;
    let supervisor_id: Option<String> = r.get(8)?;
    let sup_first: Option<String> = r.get(9)?;
    let sup_last: Option<String> = r.get(10)?;
    let supervisor_name = match (sup_first, sup_last) {
        (Some(f), Some(l)) => Some(full_name(&f, &l)),
        _ => None,
    };
    Ok(json!({
        "id": id,
        "firstName": first,
        "lastName": last,
        "email": email,
        "section": section,
        "group": group,
        "average": average,
        "meritRank": merit_rank,
        "supervisorId": supervisor_id,
        "supervisorName": supervisor_name,
    }))
}

fn query_students(
    conn: &rusqlite::Connection,
    where_sql: &str,
    order_sql: &str,
    binds: Vec<SqlValue>,
) -> rusqlite::Result<Vec<Value>> {
    let sql = format!("{} {} {}", STUDENT_SELECT, where_sql, order_sql);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), student_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_students_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "students": [] }));
    };
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<SqlValue> = Vec::new();
    if let Some(section) = opt_str(req, "section")? {
        clauses.push("s.section = ?");
        binds.push(SqlValue::Text(section));
    }
    if let Some(group) = opt_str(req, "group")? {
        clauses.push("s.group_name = ?");
        binds.push(SqlValue::Text(group));
    }
    if let Some(sup) = opt_str(req, "supervisorId")? {
        clauses.push("s.supervisor_id = ?");
        binds.push(SqlValue::Text(sup));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let students = query_students(conn, &where_sql, "ORDER BY s.last_name, s.first_name", binds)
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "students": students }))
}

fn handle_students_ranking(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    // SQLite sorts NULL first in DESC order by default.
    let students = query_students(
        conn,
        "",
        "ORDER BY s.average IS NULL, s.average DESC, s.merit_rank IS NULL, s.merit_rank, s.last_name",
        Vec::new(),
    )
    .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "students": students }))
}

fn handle_students_get(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let mut found = query_students(conn, "WHERE s.id = ?", "", vec![SqlValue::Text(student_id)])
        .map_err(db_err(req, "db_query_failed"))?;
    if found.is_empty() {
        return Err(not_found(req, "student"));
    }
    Ok(json!({ "student": found.remove(0) }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let first = required_str(req, "firstName")?;
    let last = required_str(req, "lastName")?;
    let email = normalize_email(&required_str(req, "email")?);
    let password = opt_str(req, "password")?;
    let section = opt_str(req, "section")?;
    let group = opt_str(req, "group")?;
    let average = opt_f64_range(req, &req.params, "average", 0.0, AVERAGE_MAX)?;
    let merit_rank = opt_i64_range(req, &req.params, "meritRank", 1, 1_000_000)?;

    let student_id = new_id();
    let inserted = conn.execute(
        "INSERT INTO students(id, first_name, last_name, email, password_hash, section,
                              group_name, average, merit_rank)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &first,
            &last,
            &email,
            password.as_deref().map(hash_password),
            &section,
            &group,
            average,
            merit_rank,
        ),
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(err(&req.id, "conflict", "email already in use", None));
        }
        Err(e) => {
            return Err(err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            ))
        }
    }
    Ok(json!({ "studentId": student_id }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return Err(bad_params(req, "patch must be an object"));
    };
    require_row(conn, req, "students", &student_id, "student")?;

    let mut sets: Vec<&str> = Vec::new();
    let mut binds: Vec<SqlValue> = Vec::new();
    for key in patch.as_object().map(|o| o.keys()).into_iter().flatten() {
        match key.as_str() {
            "firstName" | "lastName" | "section" | "group" => {
                if let Some(v) = opt_str_in(req, patch, key)? {
                    sets.push(match key.as_str() {
                        "firstName" => "first_name = ?",
                        "lastName" => "last_name = ?",
                        "section" => "section = ?",
                        _ => "group_name = ?",
                    });
                    binds.push(SqlValue::Text(v));
                }
            }
            "email" => {
                if let Some(v) = opt_str_in(req, patch, key)? {
                    sets.push("email = ?");
                    binds.push(SqlValue::Text(normalize_email(&v)));
                }
            }
            "password" => {
                // Blank passwords keep the current one.
                if let Some(v) = opt_str_in(req, patch, key)? {
                    sets.push("password_hash = ?");
                    binds.push(SqlValue::Text(hash_password(&v)));
                }
            }
            "average" => {
                if let Some(v) = opt_f64_range(req, patch, key, 0.0, AVERAGE_MAX)? {
                    sets.push("average = ?");
                    binds.push(SqlValue::Real(v));
                }
            }
            "meritRank" => {
                if let Some(v) = opt_i64_range(req, patch, key, 1, 1_000_000)? {
                    sets.push("merit_rank = ?");
                    binds.push(SqlValue::Integer(v));
                }
            }
            other => return Err(bad_params(req, format!("unknown student field: {}", other))),
        }
    }

    if !sets.is_empty() {
        let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
        binds.push(SqlValue::Text(student_id.clone()));
        if let Err(e) = conn.execute(&sql, params_from_iter(binds)) {
            if is_unique_violation(&e) {
                return Err(err(&req.id, "conflict", "email already in use", None));
            }
            return Err(err(&req.id, "db_update_failed", e.to_string(), None));
        }
    }
    Ok(json!({ "ok": true, "studentId": student_id }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let workspace: Option<PathBuf> = state.workspace.clone();
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    require_row(conn, req, "students", &student_id, "student")?;

    let assigned: Option<String> = conn
        .query_row(
            "SELECT id FROM assignments WHERE student1_id = ?1 OR student2_id = ?1",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err(req, "db_query_failed"))?;
    if assigned.is_some() {
        return Err(err(
            &req.id,
            "conflict",
            "student has an assignment; delete it first",
            None,
        ));
    }

    let stored: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT stored_path FROM documents WHERE student_id = ?")
            .map_err(db_err(req, "db_query_failed"))?;
        let rows = stmt
            .query_map([&student_id], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<String>, _>>())
            .map_err(db_err(req, "db_query_failed"))?;
        rows
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err(req, "db_tx_failed"))?;
    // Explicit dependency order; the schema has no ON DELETE CASCADE.
    let steps: [(&str, &str); 7] = [
        ("choices", "DELETE FROM choices WHERE student_id = ?"),
        ("choices", "UPDATE choices SET partner_id = NULL WHERE partner_id = ?"),
        ("documents", "DELETE FROM documents WHERE student_id = ?"),
        ("internships", "DELETE FROM internships WHERE student_id = ?"),
        (
            "projects",
            "UPDATE projects SET proposer_student_id = NULL WHERE proposer_student_id = ?",
        ),
        ("notifications", "DELETE FROM notifications WHERE user_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&student_id]) {
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

    if let Some(ws) = workspace {
        for rel in stored {
            let _ = std::fs::remove_file(ws.join(rel));
        }
    }
    tracing::info!(student = %student_id, "student deleted");
    Ok(json!({ "ok": true }))
}

fn handle_students_count(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "count": count }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "students.list" => handle_students_list(state, req),
        "students.ranking" => handle_students_ranking(state, req),
        "students.get" => handle_students_get(state, req),
        "students.create" => handle_students_create(state, req),
        "students.update" => handle_students_update(state, req),
        "students.delete" => handle_students_delete(state, req),
        "students.count" => handle_students_count(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
