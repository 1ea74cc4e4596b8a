use crate::backup;
use crate::ipc::error::{err, finish};
use crate::ipc::handlers::core::open_workspace;
use crate::ipc::helpers::required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;

fn active_workspace(state: &AppState, req: &Request) -> Result<PathBuf, Value> {
    state
        .workspace
        .clone()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn handle_export_backup(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let workspace_path = active_workspace(state, req)?;
    let out_path = required_str(req, "outPath")?;
    let export = backup::export_workspace_bundle(&workspace_path, &PathBuf::from(&out_path))
        .map_err(|e| {
            err(
                &req.id,
                "backup_failed",
                format!("{e:#}"),
                Some(json!({ "path": out_path })),
            )
        })?;
    tracing::info!(path = %out_path, entries = export.entry_count, "backup exported");
    Ok(json!({
        "ok": true,
        "path": out_path,
        "bundleFormat": export.bundle_format,
        "entryCount": export.entry_count,
    }))
}

fn handle_import_backup(state: &mut AppState, req: &Request) -> Result<Value, Value> {
    let workspace_path = active_workspace(state, req)?;
    let in_path = PathBuf::from(required_str(req, "inPath")?);
    if !in_path.is_file() {
        return Err(err(
            &req.id,
            "not_found",
            "backup file not found",
            Some(json!({ "path": in_path.to_string_lossy() })),
        ));
    }

    // Release the database file before it is replaced.
    state.db = None;
    let imported = backup::import_workspace_bundle(&in_path, &workspace_path);
    let reopened = open_workspace(state, &workspace_path);
    let import = imported.map_err(|e| {
        err(
            &req.id,
            "backup_failed",
            format!("{e:#}"),
            Some(json!({ "path": in_path.to_string_lossy() })),
        )
    })?;
    reopened.map_err(|e| err(&req.id, "db_open_failed", format!("{e:#}"), None))?;

    tracing::info!(path = %in_path.display(), files = import.file_count, "backup restored");
    Ok(json!({
        "ok": true,
        "workspacePath": workspace_path.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "fileCount": import.file_count,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "workspace.exportBackup" => handle_export_backup(state, req),
        "workspace.importBackup" => handle_import_backup(state, req),
        _ => return None,
    };
    Some(finish(req, result))
}
