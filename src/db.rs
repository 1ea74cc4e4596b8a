use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};

pub const DB_FILE: &str = "pfa.sqlite3";
pub const UPLOADS_DIR: &str = "uploads";

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join(DB_FILE)
}

pub fn documents_dir(workspace: &Path) -> PathBuf {
    workspace.join(UPLOADS_DIR).join("documents")
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let conn = Connection::open(db_path(workspace))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS administrators(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT,
            department TEXT,
            academic_year TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT,
            department TEXT,
            position TEXT,
            office TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT,
            section TEXT,
            group_name TEXT,
            average REAL,
            merit_rank INTEGER,
            supervisor_id TEXT,
            FOREIGN KEY(supervisor_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_supervisor ON students(supervisor_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS projects(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            domain TEXT,
            difficulty TEXT,
            proposed_on TEXT NOT NULL,
            status TEXT NOT NULL,
            proposed_by_student INTEGER NOT NULL DEFAULT 0,
            proposer_student_id TEXT,
            supervisor_id TEXT,
            capacity INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(proposer_student_id) REFERENCES students(id),
            FOREIGN KEY(supervisor_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_projects_status ON projects(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_projects_supervisor ON projects(supervisor_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS project_technologies(
            project_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY(project_id, position),
            FOREIGN KEY(project_id) REFERENCES projects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS choices(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            preference INTEGER NOT NULL,
            partner_id TEXT,
            proposed INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(project_id) REFERENCES projects(id),
            FOREIGN KEY(partner_id) REFERENCES students(id),
            UNIQUE(student_id, project_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_choices_project ON choices(project_id, preference)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL UNIQUE,
            student1_id TEXT NOT NULL,
            student2_id TEXT,
            supervisor_id TEXT,
            assigned_on TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT 'merit',
            FOREIGN KEY(project_id) REFERENCES projects(id),
            FOREIGN KEY(student1_id) REFERENCES students(id),
            FOREIGN KEY(student2_id) REFERENCES students(id),
            FOREIGN KEY(supervisor_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feedback(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            message TEXT NOT NULL,
            date TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(project_id) REFERENCES projects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meetings(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            date TEXT NOT NULL,
            notes TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(project_id) REFERENCES projects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS internships(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            company TEXT NOT NULL,
            project TEXT,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            location TEXT,
            industrial_supervisor TEXT,
            supervisor_email TEXT,
            description TEXT,
            status TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(student_id, start_date, end_date)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS documents(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            uploaded_on TEXT NOT NULL,
            stored_path TEXT NOT NULL,
            mime_type TEXT,
            size_bytes INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            student_id TEXT NOT NULL,
            internship_id TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(internship_id) REFERENCES internships(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documents_student ON documents(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documents_internship ON documents(internship_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            link TEXT,
            created_at TEXT NOT NULL,
            is_read INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS outbox(
            id TEXT PRIMARY KEY,
            recipients TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // Review decisions gained a reason column after the first schema.
    ensure_rejection_reason(&conn, "projects")?;
    ensure_rejection_reason(&conn, "documents")?;

    Ok(conn)
}

fn ensure_rejection_reason(conn: &Connection, table: &str) -> anyhow::Result<()> {
    if table_has_column(conn, table, "rejection_reason")? {
        return Ok(());
    }
    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN rejection_reason TEXT", table),
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("setting {} is not valid JSON", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
