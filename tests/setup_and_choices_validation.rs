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
fn setup_defaults_and_patch_validation() {
    let workspace = temp_dir("pfad-setup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let initial = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(
        initial.pointer("/assignment/strategy").and_then(|v| v.as_str()),
        Some("bySubject")
    );
    assert_eq!(
        initial.pointer("/assignment/minPreferences").and_then(|v| v.as_i64()),
        Some(3)
    );
    assert_eq!(
        initial.pointer("/documents/maxFileBytes").and_then(|v| v.as_i64()),
        Some(20 * 1024 * 1024)
    );
    assert_eq!(
        initial.pointer("/notifications/emailEnabled").and_then(|v| v.as_bool()),
        Some(true)
    );

    let rejects = [
        json!({ "section": "assignment", "patch": { "strategy": "lottery" } }),
        json!({ "section": "assignment", "patch": { "maxPreferences": 2 } }),
        json!({ "section": "assignment", "patch": { "minPreferences": 0 } }),
        json!({ "section": "assignment", "patch": { "supervisionMonths": 30 } }),
        json!({ "section": "documents", "patch": { "allowedExtensions": [] } }),
        json!({ "section": "notifications", "patch": { "signature": "x".repeat(121) } }),
        json!({ "section": "assignment", "patch": { "unknownKey": 1 } }),
        json!({ "section": "grading", "patch": {} }),
    ];
    for (i, params) in rejects.into_iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("r{}", i),
            "setup.update",
            params.clone(),
        );
        assert_eq!(error_code(&resp), "bad_params", "accepted {}", params);
    }

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({
            "section": "documents",
            "patch": { "allowedExtensions": [".PDF", "zip", "pdf"] }
        }),
    );
    let after = request_ok(&mut stdin, &mut reader, "4", "setup.get", json!({}));
    assert_eq!(
        after.pointer("/documents/allowedExtensions"),
        Some(&json!(["pdf", "zip"]))
    );
    assert_eq!(
        after.pointer("/assignment/maxPreferences").and_then(|v| v.as_i64()),
        Some(10)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn choice_submission_rules() {
    let workspace = temp_dir("pfad-choices");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.update",
        json!({ "section": "assignment", "patch": { "minPreferences": 2, "maxPreferences": 3 } }),
    );
    let t = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({ "firstName": "Leila", "lastName": "Mansour", "email": "leila@uni.test" }),
    );
    let teacher = t["teacherId"].as_str().expect("teacherId").to_string();
    let s = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "firstName": "Amina", "lastName": "Haddad", "email": "amina@uni.test" }),
    );
    let student = s["studentId"].as_str().expect("studentId").to_string();

    let mut open = Vec::new();
    for i in 0..4 {
        let p = request_ok(
            &mut stdin,
            &mut reader,
            &format!("p{}", i),
            "projects.proposeByTeacher",
            json!({ "teacherId": teacher, "title": format!("Project {}", i) }),
        );
        let id = p["project"]["id"].as_str().expect("id").to_string();
        if i < 3 {
            let _ = request_ok(
                &mut stdin,
                &mut reader,
                &format!("v{}", i),
                "projects.validate",
                json!({ "projectId": id }),
            );
        }
        open.push(id);
    }
    let pending_project = open[3].clone();

    let cases = [
        (json!([open[0]]), "bad_params"),
        (json!([open[0], open[1], open[2], pending_project]), "bad_params"),
        (json!([open[0], open[0]]), "bad_params"),
        (json!([open[0], pending_project]), "bad_params"),
        (json!([open[0], "missing-project"]), "not_found"),
    ];
    for (i, (ids, code)) in cases.into_iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("c{}", i),
            "choices.submit",
            json!({ "studentId": student, "projectIds": ids }),
        );
        assert_eq!(error_code(&resp), code, "case {}", i);
    }

    let unknown_student = request(
        &mut stdin,
        &mut reader,
        "5",
        "choices.submit",
        json!({ "studentId": "ghost", "projectIds": [open[0], open[1]] }),
    );
    assert_eq!(error_code(&unknown_student), "not_found");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "choices.submit",
        json!({ "studentId": student, "projectIds": [open[2], open[0]] }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "choices.submit",
        json!({ "studentId": student, "projectIds": [open[1], open[2]] }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "choices.list",
        json!({ "studentId": student }),
    );
    let rows = listed["choices"].as_array().expect("choices");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["projectId"], json!(open[1]));
    assert_eq!(rows[0]["preference"], json!(1));
    assert_eq!(rows[1]["project"], json!("Project 2"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "setup.update",
        json!({ "section": "assignment", "patch": { "allowPairs": false } }),
    );
    let s2 = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.create",
        json!({ "firstName": "Youssef", "lastName": "Karim", "email": "youssef@uni.test" }),
    );
    let partner = s2["studentId"].as_str().expect("studentId").to_string();
    let no_pairs = request(
        &mut stdin,
        &mut reader,
        "11",
        "choices.submit",
        json!({ "studentId": student, "projectIds": [open[0], open[1]], "partnerId": partner }),
    );
    assert_eq!(error_code(&no_pairs), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
