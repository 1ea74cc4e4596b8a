use crate::credentials::sha256_hex;
use crate::db::{documents_dir, UPLOADS_DIR};
use crate::ipc::error::{err, finish};
use crate::ipc::handlers::internships::promote_internship;
use crate::ipc::handlers::setup::document_settings;
use crate::ipc::helpers::{
    bad_params, db_conn, db_err, full_name, new_id, not_found, now_ts, opt_str, require_row,
    required_str, row_exists, transition_failed,
};
use crate::ipc::types::{AppState, Request};
use crate::workflow::{DocumentKind, DocumentStatus};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

const DOCUMENT_SELECT: &str = "SELECT d.id, d.name, d.kind, d.status, d.uploaded_on,
            d.stored_path, d.mime_type, d.size_bytes, d.sha256, d.student_id,
            s.first_name, s.last_name, d.internship_id, d.rejection_reason
     FROM documents d
     JOIN students s ON s.id = d.student_id";

fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| !e.is_empty())
}

fn document_row(r: &Row) -> rusqlite::Result<Value> {
    let kind_raw: String = r.get(2)?;
    let status_raw: String = r.get(3)?;
    let status = DocumentStatus::parse(&status_raw).unwrap_or(DocumentStatus::Pending);
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "kind": DocumentKind::parse(&kind_raw).map(|k| k.as_str()).unwrap_or("report"),
        "status": status.as_str(),
        "statusLabel": status.label(),
        "uploadedOn": r.get::<_, String>(4)?,
        "storedPath": r.get::<_, String>(5)?,
        "mimeType": r.get::<_, String>(6)?,
        "sizeBytes": r.get::<_, i64>(7)?,
        "sha256": r.get::<_, String>(8)?,
        "studentId": r.get::<_, String>(9)?,
        "student": full_name(&r.get::<_, String>(10)?, &r.get::<_, String>(11)?),
        "internshipId": r.get::<_, Option<String>>(12)?,
        "rejectionReason": r.get::<_, Option<String>>(13)?,
    }))
}

fn single_document(conn: &Connection, req: &Request, id: &str) -> Result<Value, Value> {
    conn.query_row(
        &format!("{} WHERE d.id = ?", DOCUMENT_SELECT),
        [id],
        document_row,
    )
    .optional()
    .map_err(db_err(req, "db_query_failed"))?
    .ok_or_else(|| not_found(req, "document"))
}

/// Internship link to keep for an upload; unknown or foreign ids are dropped.
fn usable_internship(
    conn: &Connection,
    student_id: &str,
    internship_id: Option<String>,
) -> rusqlite::Result<Option<String>> {
    let Some(id) = internship_id else {
        return Ok(None);
    };
    let owner: Option<String> = conn
        .query_row(
            "SELECT student_id FROM internships WHERE id = ?",
            [&id],
            |r| r.get(0),
        )
        .optional()?;
    match owner {
        Some(o) if o == student_id => Ok(Some(id)),
        Some(_) => {
            tracing::warn!(internship = %id, student = %student_id, "internship belongs to another student; document kept unlinked");
            Ok(None)
        }
        None => {
            tracing::warn!(internship = %id, "unknown internship; document kept unlinked");
            Ok(None)
        }
    }
}

fn handle_documents_upload(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let Some(workspace) = state.workspace.clone() else {
        return Err(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let conn = db_conn(state, req)?;
    let student_id = required_str(req, "studentId")?;
    let kind_raw = required_str(req, "kind")?;
    let kind = DocumentKind::parse(&kind_raw)
        .ok_or_else(|| bad_params(req, "kind must be one of: report, poster, certificate"))?;
    let source = PathBuf::from(required_str(req, "sourcePath")?);
    require_row(conn, req, "students", &student_id, "student")?;

    let settings = document_settings(conn);
    let ext = extension_of(&source)
        .ok_or_else(|| bad_params(req, "file has no extension"))?;
    if !settings.allowed_extensions.iter().any(|a| a == &ext) {
        return Err(bad_params(
            req,
            format!("file type .{} is not allowed", ext),
        ));
    }
    let meta = std::fs::metadata(&source).map_err(|e| {
        err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": source.to_string_lossy() })),
        )
    })?;
    if !meta.is_file() {
        return Err(bad_params(req, "sourcePath is not a file"));
    }
    if meta.len() > settings.max_file_bytes {
        return Err(bad_params(
            req,
            format!(
                "file is too large ({} bytes, limit {})",
                meta.len(),
                settings.max_file_bytes
            ),
        ));
    }
    let bytes = std::fs::read(&source).map_err(db_err(req, "io_failed"))?;
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("document.{}", ext));

    let internship_id = usable_internship(conn, &student_id, opt_str(req, "internshipId")?)
        .map_err(db_err(req, "db_query_failed"))?;

    let id = new_id();
    let file_name = format!("{}.{}", id, ext);
    let dir = documents_dir(&workspace);
    std::fs::create_dir_all(&dir).map_err(db_err(req, "io_failed"))?;
    let dest = dir.join(&file_name);
    std::fs::write(&dest, &bytes).map_err(db_err(req, "io_failed"))?;
    let stored_path = format!("{}/documents/{}", UPLOADS_DIR, file_name);

    let inserted = conn.execute(
        "INSERT INTO documents(id, name, kind, status, uploaded_on, stored_path, mime_type,
                               size_bytes, sha256, student_id, internship_id)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &name,
            kind.as_str(),
            DocumentStatus::Pending.as_str(),
            now_ts(),
            &stored_path,
            mime_for_extension(&ext),
            bytes.len() as i64,
            sha256_hex(&bytes),
            &student_id,
            &internship_id,
        ),
    );
    if let Err(e) = inserted {
        let _ = std::fs::remove_file(&dest);
        return Err(err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "documents" })),
        ));
    }
    if let Some(iid) = internship_id.as_deref() {
        promote_internship(conn, iid).map_err(db_err(req, "db_update_failed"))?;
    }
    tracing::info!(document = %id, kind = kind.as_str(), size = bytes.len(), "document uploaded");
    Ok(json!({ "document": single_document(conn, req, &id)? }))
}

fn handle_documents_list(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "documents": [] }));
    };
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<SqlValue> = Vec::new();
    match opt_str(req, "scope")?.as_deref() {
        None | Some("all") => {}
        Some("withInternship") => clauses.push("d.internship_id IS NOT NULL"),
        Some("withoutInternship") => clauses.push("d.internship_id IS NULL"),
        Some(_) => {
            return Err(bad_params(
                req,
                "scope must be one of: all, withInternship, withoutInternship",
            ))
        }
    }
    if let Some(student_id) = opt_str(req, "studentId")? {
        clauses.push("d.student_id = ?");
        binds.push(SqlValue::Text(student_id));
    }
    if let Some(internship_id) = opt_str(req, "internshipId")? {
        clauses.push("d.internship_id = ?");
        binds.push(SqlValue::Text(internship_id));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!("{} {} ORDER BY d.uploaded_on DESC", DOCUMENT_SELECT, where_sql);
    let mut stmt = conn.prepare(&sql).map_err(db_err(req, "db_query_failed"))?;
    let documents = stmt
        .query_map(params_from_iter(binds), document_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err(req, "db_query_failed"))?;
    Ok(json!({ "documents": documents }))
}

fn handle_documents_get(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    let id = required_str(req, "documentId")?;
    Ok(json!({ "document": single_document(conn, req, &id)? }))
}

fn review(req: &Request, conn: &Connection, to: DocumentStatus) -> Result<Value, Value> {
    let id = required_str(req, "documentId")?;
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT status, internship_id FROM documents WHERE id = ?",
            [&id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err(req, "db_query_failed"))?;
    let Some((status_raw, internship_id)) = row else {
        return Err(not_found(req, "document"));
    };
    let current = DocumentStatus::parse(&status_raw).unwrap_or(DocumentStatus::Pending);
    let next = current
        .transition("document", to)
        .map_err(|e| transition_failed(req, &e))?;
    let reason = match next {
        DocumentStatus::Rejected => opt_str(req, "reason")?,
        _ => None,
    };
    // Status change and internship promotion commit together.
    let tx = conn
        .unchecked_transaction()
        .map_err(db_err(req, "db_tx_failed"))?;
    let applied = tx
        .execute(
            "UPDATE documents SET status = ?, rejection_reason = ? WHERE id = ?",
            (next.as_str(), &reason, &id),
        )
        .and_then(|_| match internship_id.as_deref() {
            Some(iid) if row_exists(&tx, "internships", iid)? => {
                promote_internship(&tx, iid).map(|_| ())
            }
            _ => Ok(()),
        });
    if let Err(e) = applied {
        let _ = tx.rollback();
        return Err(err(&req.id, "db_update_failed", e.to_string(), None));
    }
    tx.commit().map_err(db_err(req, "db_tx_failed"))?;
    tracing::info!(document = %id, to = next.as_str(), "document reviewed");
    Ok(json!({ "document": single_document(conn, req, &id)? }))
}

fn handle_documents_validate(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    review(req, conn, DocumentStatus::Validated)
}

fn handle_documents_reject(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let conn = db_conn(state, req)?;
    review(req, conn, DocumentStatus::Rejected)
}

fn handle_documents_export(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let Some(workspace) = state.workspace.clone() else {
        return Err(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let conn = db_conn(state, req)?;
    let id = required_str(req, "documentId")?;
    let out_path = PathBuf::from(required_str(req, "outPath")?);
    let stored: Option<String> = conn
        .query_row(
            "SELECT stored_path FROM documents WHERE id = ?",
            [&id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err(req, "db_query_failed"))?;
    let Some(stored) = stored else {
        return Err(not_found(req, "document"));
    };
    let src = workspace.join(&stored);
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(db_err(req, "io_failed"))?;
        }
    }
    let bytes = std::fs::copy(&src, &out_path).map_err(|e| {
        err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": src.to_string_lossy() })),
        )
    })?;
    Ok(json!({ "ok": true, "path": out_path.to_string_lossy(), "bytes": bytes }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "documents.upload" => handle_documents_upload(state, req),
        "documents.list" => handle_documents_list(state, req),
        "documents.get" => handle_documents_get(state, req),
        "documents.validate" => handle_documents_validate(state, req),
        "documents.reject" => handle_documents_reject(state, req),
        "documents.export" => handle_documents_export(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
