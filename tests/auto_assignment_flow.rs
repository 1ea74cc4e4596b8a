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

struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    seq: usize,
}

impl Sidecar {
    fn start(workspace: &PathBuf) -> Self {
        let (child, stdin, reader) = spawn_sidecar();
        let mut s = Sidecar {
            child,
            stdin,
            reader,
            seq: 0,
        };
        s.ok(
            "workspace.select",
            json!({ "path": workspace.to_string_lossy() }),
        );
        s
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.seq += 1;
        let id = self.seq.to_string();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.seq += 1;
        let id = self.seq.to_string();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn student(&mut self, first: &str, last: &str, average: Option<f64>) -> String {
        let res = self.ok(
            "students.create",
            json!({
                "firstName": first,
                "lastName": last,
                "email": format!("{}.{}@school.test", first, last).to_lowercase(),
                "average": average,
            }),
        );
        res["studentId"].as_str().expect("studentId").to_string()
    }

    fn teacher(&mut self, first: &str, last: &str) -> String {
        let res = self.ok(
            "teachers.create",
            json!({
                "firstName": first,
                "lastName": last,
                "email": format!("{}.{}@school.test", first, last).to_lowercase(),
            }),
        );
        res["teacherId"].as_str().expect("teacherId").to_string()
    }

    fn open_project(&mut self, teacher_id: &str, title: &str) -> String {
        let res = self.ok(
            "projects.proposeByTeacher",
            json!({ "teacherId": teacher_id, "title": title, "technologies": ["Rust"] }),
        );
        let id = res["project"]["id"].as_str().expect("project id").to_string();
        self.ok("projects.validate", json!({ "projectId": id }));
        id
    }

    fn choose(&mut self, student_id: &str, project_ids: &[&str]) {
        self.ok(
            "choices.submit",
            json!({ "studentId": student_id, "projectIds": project_ids }),
        );
    }

    fn close(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
    }
}

fn project_of(sc: &mut Sidecar, student_id: &str) -> Option<String> {
    let resp = sc.call("assignments.forStudent", json!({ "studentId": student_id }));
    if error_code(&resp) == "not_found" {
        return None;
    }
    resp.pointer("/result/assignment/projectId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[test]
fn by_subject_run_assigns_notifies_and_is_idempotent() {
    let workspace = temp_dir("pfad-auto-subject");
    let mut sc = Sidecar::start(&workspace);
    sc.ok(
        "setup.update",
        json!({ "section": "assignment", "patch": { "minPreferences": 1, "maxPreferences": 3 } }),
    );

    let teacher = sc.teacher("Leila", "Mansour");
    let a = sc.student("Amina", "Haddad", Some(15.0));
    let b = sc.student("Bilel", "Trabelsi", Some(17.0));
    let c = sc.student("Chaima", "Sassi", None);
    let d = sc.student("Dali", "Ayari", Some(12.0));
    let p1 = sc.open_project(&teacher, "Compiler");
    let p2 = sc.open_project(&teacher, "Scheduler");

    sc.choose(&a, &[&p1, &p2]);
    sc.choose(&b, &[&p1]);
    sc.choose(&c, &[&p1, &p2]);
    sc.choose(&d, &[&p2]);
    assert_eq!(sc.ok("choices.count", json!({}))["count"], json!(4));

    let run = sc.ok("assignments.auto", json!({}));
    assert_eq!(run["created"], json!(2), "{}", run);
    assert_eq!(run["assignments"].as_array().map(|a| a.len()), Some(2));

    assert_eq!(project_of(&mut sc, &b), Some(p1.clone()));
    assert_eq!(project_of(&mut sc, &a), Some(p2.clone()));
    assert_eq!(project_of(&mut sc, &c), None);
    assert_eq!(project_of(&mut sc, &d), None);

    let dto = sc.ok("assignments.forStudent", json!({ "studentId": b }));
    assert_eq!(dto["assignment"]["supervisor"], json!("Leila Mansour"));
    assert_eq!(dto["assignment"]["student1"], json!("Bilel Trabelsi"));
    assert!(dto["assignment"]["student2Id"].is_null());

    let student_b = sc.ok("students.get", json!({ "studentId": b }));
    assert_eq!(student_b["student"]["supervisorId"], json!(teacher));

    let notes = sc.ok("notifications.list", json!({ "userId": b }));
    let notes = notes["notifications"].as_array().expect("notifications").clone();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0]["title"], json!("Project assignment"));
    assert_eq!(notes[0]["link"], json!(format!("/projects/{}", p1)));

    let teacher_notes = sc.ok("notifications.list", json!({ "userId": teacher }));
    let teacher_notes = teacher_notes["notifications"].as_array().expect("list").clone();
    assert_eq!(teacher_notes.len(), 2);
    assert!(teacher_notes.iter().all(|n| n["title"] == json!("New assignment")));

    let outbox = sc.ok("outbox.list", json!({}));
    let mails = outbox["mails"].as_array().expect("mails").clone();
    assert_eq!(mails.len(), 2);
    assert!(mails[0]["body"]
        .as_str()
        .unwrap_or("")
        .ends_with("The project management team"));

    let again = sc.ok("assignments.auto", json!({}));
    assert_eq!(again["created"], json!(0));
    assert_eq!(again["message"], json!("No new assignment could be made"));

    assert_eq!(
        sc.ok("assignments.studentCount", json!({ "teacherId": teacher }))["count"],
        json!(2)
    );
    assert_eq!(sc.ok("assignments.supervisorCount", json!({}))["count"], json!(1));
    let profile = sc.ok("teachers.profile", json!({ "teacherId": teacher }));
    assert_eq!(profile["teacher"]["supervisedStudentCount"], json!(2));
    let available = sc.ok("projects.available", json!({}));
    assert_eq!(available["projects"], json!([]));

    let assignment_id = dto["assignment"]["id"].as_str().expect("id").to_string();
    sc.ok("assignments.delete", json!({ "assignmentId": assignment_id }));
    let student_b = sc.ok("students.get", json!({ "studentId": b }));
    assert!(student_b["student"]["supervisorId"].is_null());
    assert_eq!(project_of(&mut sc, &b), None);

    let notes = sc.ok("notifications.list", json!({ "userId": b }));
    let notes = notes["notifications"].as_array().expect("list").clone();
    assert_eq!(notes.len(), 2);
    assert_eq!(notes[0]["title"], json!("Assignment cancelled"));

    let first_id = notes[0]["id"].as_str().expect("id").to_string();
    sc.ok("notifications.markRead", json!({ "notificationId": first_id }));
    let unread = sc.ok("notifications.list", json!({ "userId": b, "unreadOnly": true }));
    assert_eq!(unread["notifications"].as_array().map(|a| a.len()), Some(1));

    sc.close();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn by_merit_honors_best_students_first_preference() {
    let workspace = temp_dir("pfad-auto-merit");
    let mut sc = Sidecar::start(&workspace);
    sc.ok(
        "setup.update",
        json!({
            "section": "assignment",
            "patch": { "strategy": "byMerit", "minPreferences": 1 }
        }),
    );
    sc.ok(
        "setup.update",
        json!({ "section": "notifications", "patch": { "emailEnabled": false } }),
    );

    let teacher = sc.teacher("Leila", "Mansour");
    let x = sc.student("Xavier", "Ben", Some(18.0));
    let y = sc.student("Yasmine", "Gharbi", Some(16.0));
    let p1 = sc.open_project(&teacher, "Compiler");
    let p2 = sc.open_project(&teacher, "Scheduler");
    sc.choose(&x, &[&p2, &p1]);
    sc.choose(&y, &[&p1]);

    let run = sc.ok("assignments.auto", json!({}));
    assert_eq!(run["created"], json!(2), "{}", run);
    assert_eq!(project_of(&mut sc, &x), Some(p2));
    assert_eq!(project_of(&mut sc, &y), Some(p1));

    let outbox = sc.ok("outbox.list", json!({}));
    assert_eq!(outbox["mails"], json!([]));

    sc.close();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn supervisor_capacity_stops_by_subject_run() {
    let workspace = temp_dir("pfad-auto-capacity");
    let mut sc = Sidecar::start(&workspace);
    sc.ok(
        "setup.update",
        json!({
            "section": "assignment",
            "patch": { "minPreferences": 1, "supervisorCapacity": 1 }
        }),
    );

    let teacher = sc.teacher("Leila", "Mansour");
    let x = sc.student("Xavier", "Ben", Some(18.0));
    let y = sc.student("Yasmine", "Gharbi", Some(16.0));
    let p1 = sc.open_project(&teacher, "Compiler");
    let p2 = sc.open_project(&teacher, "Scheduler");
    sc.choose(&x, &[&p2, &p1]);
    sc.choose(&y, &[&p1, &p2]);

    let run = sc.ok("assignments.auto", json!({}));
    assert_eq!(run["created"], json!(1), "{}", run);
    assert_eq!(project_of(&mut sc, &x), Some(p1));
    assert_eq!(project_of(&mut sc, &y), None);
    let skipped = run["skipped"].as_array().expect("skipped");
    assert!(skipped.iter().any(|s| {
        s["projectId"] == json!(p2) && s["reason"] == json!("supervisor_full")
    }));

    sc.close();
    let _ = std::fs::remove_dir_all(workspace);
}
