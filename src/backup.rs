use anyhow::{anyhow, Context};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_FILE: &str = "pfa.sqlite3";
const DB_ENTRY: &str = "db/pfa.sqlite3";
const UPLOADS_DIR: &str = "uploads";
const STAGING_DIR: &str = ".restore";
pub const BUNDLE_FORMAT: &str = "pfa-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub file_count: usize,
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Files under `dir`, as paths relative to `root` with `/` separators.
fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> anyhow::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.to_string_lossy()))?
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if path.is_file() {
            let rel = path
                .strip_prefix(root)
                .context("upload outside workspace")?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            out.push(rel);
        }
    }
    Ok(())
}

/// Entry names must stay inside the workspace.
fn safe_relative(name: &str) -> Option<PathBuf> {
    let p = Path::new(name);
    let ok = !name.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_)));
    ok.then(|| p.to_path_buf())
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut sources: Vec<(String, PathBuf)> = vec![(DB_ENTRY.to_string(), db_path)];
    let mut uploads = Vec::new();
    collect_files(
        workspace_path,
        &workspace_path.join(UPLOADS_DIR),
        &mut uploads,
    )?;
    for rel in uploads {
        let src = workspace_path.join(&rel);
        sources.push((rel, src));
    }

    let mut files = Vec::with_capacity(sources.len());
    for (entry, src) in &sources {
        let bytes = std::fs::read(src)
            .with_context(|| format!("failed to read {}", src.to_string_lossy()))?;
        zip.start_file(entry.as_str(), opts)
            .with_context(|| format!("failed to start entry {}", entry))?;
        zip.write_all(&bytes)
            .with_context(|| format!("failed to write entry {}", entry))?;
        files.push(json!({
            "path": entry,
            "size": bytes.len(),
            "sha256": sha256_hex(&bytes),
        }));
    }

    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": chrono::Utc::now().to_rfc3339(),
        "files": files,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT.to_string(),
        entry_count: sources.len() + 1,
    })
}

/// Restores a bundle into `workspace_path`. The caller must have closed the database.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }
    let files = manifest
        .get("files")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("manifest.json has no file list"))?;

    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let staging = workspace_path.join(STAGING_DIR);
    if staging.exists() {
        std::fs::remove_dir_all(&staging).context("failed to clear restore staging")?;
    }

    let mut saw_db = false;
    for file in files {
        let name = file
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("manifest entry without path"))?;
        let expected = file
            .get("sha256")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("manifest entry {} has no checksum", name))?;
        let rel = safe_relative(name).ok_or_else(|| anyhow!("unsafe entry path: {}", name))?;
        if name != DB_ENTRY && !name.starts_with(&format!("{}/", UPLOADS_DIR)) {
            return Err(anyhow!("unexpected bundle entry: {}", name));
        }

        let mut bytes = Vec::new();
        archive
            .by_name(name)
            .with_context(|| format!("bundle missing {}", name))?
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed to read {}", name))?;
        let actual = sha256_hex(&bytes);
        if actual != expected {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(anyhow!("checksum mismatch for {}", name));
        }

        let dst = staging.join(&rel);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dst)
            .with_context(|| format!("failed to stage {}", dst.to_string_lossy()))?;
        out.write_all(&bytes)?;
        out.flush()?;
        saw_db |= name == DB_ENTRY;
    }
    if !saw_db {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(anyhow!("bundle missing {}", DB_ENTRY));
    }

    // Everything verified; swap the staged copy in.
    let dst_db = workspace_path.join(DB_FILE);
    if dst_db.exists() {
        std::fs::remove_file(&dst_db).with_context(|| {
            format!(
                "failed to remove existing database {}",
                dst_db.to_string_lossy()
            )
        })?;
    }
    std::fs::rename(staging.join(DB_ENTRY), &dst_db).with_context(|| {
        format!(
            "failed to move restored database to {}",
            dst_db.to_string_lossy()
        )
    })?;

    let dst_uploads = workspace_path.join(UPLOADS_DIR);
    if dst_uploads.exists() {
        std::fs::remove_dir_all(&dst_uploads).context("failed to clear uploads")?;
    }
    let staged_uploads = staging.join(UPLOADS_DIR);
    if staged_uploads.is_dir() {
        std::fs::rename(&staged_uploads, &dst_uploads).context("failed to restore uploads")?;
    }
    let _ = std::fs::remove_dir_all(&staging);

    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT.to_string(),
        file_count: files.len(),
    })
}
