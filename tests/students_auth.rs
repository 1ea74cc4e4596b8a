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
fn login_resolves_role_by_email_and_password() {
    let workspace = temp_dir("pfad-auth");
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
        json!({
            "firstName": "Amina",
            "lastName": "Haddad",
            "email": "Amina@Uni.test",
            "password": "pass-1",
        }),
    );
    let student = s["studentId"].as_str().expect("studentId").to_string();
    let a = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "admins.create",
        json!({
            "firstName": "Nadia",
            "lastName": "Ferchichi",
            "email": "director@uni.test",
            "password": "boss",
            "academicYear": "2024-2025",
        }),
    );
    let admin = a["adminId"].as_str().expect("adminId").to_string();

    let login = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "email": " AMINA@uni.test ", "password": "pass-1" }),
    );
    assert_eq!(login, json!({ "userId": student, "role": "student" }));

    let director = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "auth.login",
        json!({ "email": "director@uni.test", "password": "boss" }),
    );
    assert_eq!(director["role"], json!("director"));
    assert_eq!(director["userId"], json!(admin));

    let wrong = request(
        &mut stdin,
        &mut reader,
        "6",
        "auth.login",
        json!({ "email": "amina@uni.test", "password": "nope" }),
    );
    assert_eq!(error_code(&wrong), "unauthorized");

    let admin_row = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "admins.get",
        json!({ "adminId": admin }),
    );
    assert_eq!(admin_row["admin"]["academicYear"], json!("2024-2025"));

    // Password change through the patch takes effect on the next login.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.update",
        json!({ "studentId": student, "patch": { "password": "pass-2" } }),
    );
    let old = request(
        &mut stdin,
        &mut reader,
        "9",
        "auth.login",
        json!({ "email": "amina@uni.test", "password": "pass-1" }),
    );
    assert_eq!(error_code(&old), "unauthorized");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "auth.login",
        json!({ "email": "amina@uni.test", "password": "pass-2" }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_records_rank_update_and_delete() {
    let workspace = temp_dir("pfad-students");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let mut ids = Vec::new();
    for (i, (first, avg, rank)) in [
        ("Amina", json!(14.5), json!(null)),
        ("Bilel", json!(null), json!(1)),
        ("Chaima", json!(17.25), json!(null)),
        ("Dali", json!(14.5), json!(2)),
    ]
    .into_iter()
    .enumerate()
    {
        let section = if i % 2 == 0 { "GL" } else { "RT" };
        let s = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({
                "firstName": first,
                "lastName": "Test",
                "email": format!("{}@uni.test", first.to_lowercase()),
                "average": avg,
                "meritRank": rank,
                "section": section,
            }),
        );
        ids.push(s["studentId"].as_str().expect("studentId").to_string());
    }

    let ranking = request_ok(&mut stdin, &mut reader, "2", "students.ranking", json!({}));
    let order: Vec<&str> = ranking["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["firstName"].as_str())
        .collect();
    assert_eq!(order, vec!["Chaima", "Dali", "Amina", "Bilel"]);

    let gl = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.list",
        json!({ "section": "GL" }),
    );
    assert_eq!(gl["students"].as_array().map(|a| a.len()), Some(2));

    let dup = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "firstName": "Again", "lastName": "Test", "email": "AMINA@uni.test" }),
    );
    assert_eq!(error_code(&dup), "conflict");

    let out_of_range = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.update",
        json!({ "studentId": ids[0], "patch": { "average": 21 } }),
    );
    assert_eq!(error_code(&out_of_range), "bad_params");
    let unknown_field = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.update",
        json!({ "studentId": ids[0], "patch": { "shoeSize": 42 } }),
    );
    assert_eq!(error_code(&unknown_field), "bad_params");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.update",
        json!({ "studentId": ids[0], "patch": { "average": 19.0, "group": "G2" } }),
    );
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.get",
        json!({ "studentId": ids[0] }),
    );
    assert_eq!(updated["student"]["average"], json!(19.0));
    assert_eq!(updated["student"]["group"], json!("G2"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.delete",
        json!({ "studentId": ids[1] }),
    );
    let count = request_ok(&mut stdin, &mut reader, "10", "students.count", json!({}));
    assert_eq!(count["count"], json!(3));
    let missing = request(
        &mut stdin,
        &mut reader,
        "11",
        "students.get",
        json!({ "studentId": ids[1] }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
