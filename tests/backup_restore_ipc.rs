use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_pfad");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn pfad");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn backup_restores_records_and_uploads_over_ipc() {
    let workspace = temp_dir("pfad-backup-ipc");
    let files = temp_dir("pfad-backup-ipc-src");
    let poster = files.join("poster.png");
    std::fs::write(&poster, b"png-bytes").expect("write poster");
    let bundle = files.join("backup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let s = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "firstName": "Amina", "lastName": "Haddad", "email": "amina@uni.test" }),
    );
    let student = s["studentId"].as_str().expect("studentId").to_string();
    let uploaded = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "documents.upload",
        json!({ "studentId": student, "kind": "poster", "sourcePath": poster.to_string_lossy() }),
    );
    let stored = uploaded["document"]["storedPath"]
        .as_str()
        .expect("storedPath")
        .to_string();

    let export = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.exportBackup",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(export["bundleFormat"], json!("pfa-workspace-v1"));

    // Diverge after the backup, then restore.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.delete",
        json!({ "studentId": student }),
    );
    assert!(!workspace.join(&stored).exists());

    let restored = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "workspace.importBackup",
        json!({ "inPath": bundle.to_string_lossy() }),
    );
    assert_eq!(restored["bundleFormatDetected"], json!("pfa-workspace-v1"));

    let back = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.get",
        json!({ "studentId": student }),
    );
    assert_eq!(back["student"]["email"], json!("amina@uni.test"));
    assert_eq!(std::fs::read(workspace.join(&stored)).expect("upload"), b"png-bytes");

    let missing = request(
        &mut stdin,
        &mut reader,
        "8",
        "workspace.importBackup",
        json!({ "inPath": files.join("nope.zip").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing), "not_found");

    let not_zip = files.join("notes.zip");
    std::fs::write(&not_zip, b"plain text").expect("write fake bundle");
    let corrupt = request(
        &mut stdin,
        &mut reader,
        "9",
        "workspace.importBackup",
        json!({ "inPath": not_zip.to_string_lossy() }),
    );
    assert_eq!(error_code(&corrupt), "backup_failed");
    let still_there = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.get",
        json!({ "studentId": student }),
    );
    assert_eq!(still_there["student"]["email"], json!("amina@uni.test"));

    let blocked = request(
        &mut stdin,
        &mut reader,
        "11",
        "workspace.exportBackup",
        json!({ "outPath": poster.join("out.zip").to_string_lossy() }),
    );
    assert_eq!(error_code(&blocked), "backup_failed");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
    let _ = std::fs::remove_dir_all(files);
}
