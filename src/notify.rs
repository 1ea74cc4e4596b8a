//! In-app notifications and outbox mail for assignment events.
//!
//! Message text is built by pure functions; `record` persists what they produce.

use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

pub const UNASSIGNED: &str = "Unassigned";

#[derive(Debug, Clone)]
pub struct Person {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl Person {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone)]
pub struct AssignmentParties {
    pub project_id: String,
    pub project_title: String,
    pub project_description: Option<String>,
    pub student: Person,
    pub partner: Option<Person>,
    pub supervisor: Option<Person>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Assigned,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mail {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

fn project_link(project_id: &str) -> String {
    format!("/projects/{}", project_id)
}

fn supervision_link(project_id: &str) -> String {
    format!("/supervision/{}", project_id)
}

pub fn notices(event: Event, p: &AssignmentParties) -> Vec<Notice> {
    let title = &p.project_title;
    let mut out = Vec::with_capacity(3);
    let (student_title, student_msg) = match event {
        Event::Assigned => (
            "Project assignment",
            format!("You have been assigned to the project: {}", title),
        ),
        Event::Cancelled => (
            "Assignment cancelled",
            format!("Your assignment to the project '{}' has been cancelled.", title),
        ),
    };
    out.push(Notice {
        user_id: p.student.id.clone(),
        title: student_title.to_string(),
        message: student_msg,
        link: project_link(&p.project_id),
    });

    if let Some(partner) = p.partner.as_ref() {
        let (t, m) = match event {
            Event::Assigned => (
                "Pair project assignment",
                format!(
                    "You have been assigned to the project {} with {}",
                    title, p.student.first_name
                ),
            ),
            Event::Cancelled => (
                "Pair assignment cancelled",
                format!(
                    "Your assignment to the project '{}' with {} has been cancelled.",
                    title, p.student.first_name
                ),
            ),
        };
        out.push(Notice {
            user_id: partner.id.clone(),
            title: t.to_string(),
            message: m,
            link: project_link(&p.project_id),
        });
    }

    if let Some(sup) = p.supervisor.as_ref() {
        let (t, m) = match event {
            Event::Assigned => (
                "New assignment",
                format!("New students assigned to your project: {}", title),
            ),
            Event::Cancelled => (
                "Assignment cancelled",
                format!(
                    "The assignment of students to the project '{}' has been cancelled.",
                    title
                ),
            ),
        };
        out.push(Notice {
            user_id: sup.id.clone(),
            title: t.to_string(),
            message: m,
            link: supervision_link(&p.project_id),
        });
    }
    out
}

pub fn mail(event: Event, p: &AssignmentParties, signature: &str) -> Mail {
    let mut recipients = vec![p.student.email.clone()];
    recipients.extend(p.partner.iter().map(|s| s.email.clone()));
    recipients.extend(p.supervisor.iter().map(|s| s.email.clone()));

    let mut body = String::from("Hello,\n\n");
    match event {
        Event::Assigned => body.push_str("You are concerned by the following assignment:\n\n"),
        Event::Cancelled => body.push_str("The following assignment has been cancelled:\n\n"),
    }
    body.push_str(&format!("Project: {}\n", p.project_title));
    if event == Event::Assigned {
        body.push_str(&format!(
            "Description: {}\n\n",
            p.project_description.as_deref().unwrap_or("")
        ));
    }
    body.push_str(&format!("Main student: {}\n", p.student.full_name()));
    if let Some(partner) = p.partner.as_ref() {
        body.push_str(&format!("Partner: {}\n", partner.full_name()));
    }
    match p.supervisor.as_ref() {
        Some(sup) => body.push_str(&format!("Supervisor: Dr. {}\n", sup.full_name())),
        None => body.push_str(&format!("Supervisor: {}\n", UNASSIGNED)),
    }
    body.push_str("\nBest regards,\n");
    body.push_str(signature);

    let subject = match event {
        Event::Assigned => "New project assignment",
        Event::Cancelled => "Project assignment cancelled",
    };
    Mail {
        recipients,
        subject: subject.to_string(),
        body,
    }
}

fn load_person(conn: &Connection, table: &str, id: &str) -> rusqlite::Result<Option<Person>> {
    let sql = format!(
        "SELECT id, first_name, last_name, email FROM {} WHERE id = ?",
        table
    );
    conn.query_row(&sql, [id], |r| {
        Ok(Person {
            id: r.get(0)?,
            first_name: r.get(1)?,
            last_name: r.get(2)?,
            email: r.get(3)?,
        })
    })
    .optional()
}

/// Everyone concerned by an assignment row, or None if it is gone.
pub fn load_parties(conn: &Connection, assignment_id: &str) -> rusqlite::Result<Option<AssignmentParties>> {
    let row: Option<(String, String, Option<String>, String, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT a.project_id, p.title, p.description, a.student1_id, a.student2_id,
                    a.supervisor_id
             FROM assignments a
             JOIN projects p ON p.id = a.project_id
             WHERE a.id = ?",
            [assignment_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
        )
        .optional()?;
    let Some((project_id, project_title, project_description, s1, s2, sup)) = row else {
        return Ok(None);
    };
    let Some(student) = load_person(conn, "students", &s1)? else {
        return Ok(None);
    };
    let partner = match s2 {
        Some(id) => load_person(conn, "students", &id)?,
        None => None,
    };
    let supervisor = match sup {
        Some(id) => load_person(conn, "teachers", &id)?,
        None => None,
    };
    Ok(Some(AssignmentParties {
        project_id,
        project_title,
        project_description,
        student,
        partner,
        supervisor,
    }))
}

/// Stores the notices and, when `mail_signature` is set, one outbox mail.
pub fn record(
    conn: &Connection,
    event: Event,
    parties: &AssignmentParties,
    mail_signature: Option<&str>,
) -> rusqlite::Result<usize> {
    let now = chrono::Utc::now().to_rfc3339();
    let list = notices(event, parties);
    for n in &list {
        conn.execute(
            "INSERT INTO notifications(id, user_id, title, message, link, created_at, is_read)
             VALUES(?, ?, ?, ?, ?, ?, 0)",
            (
                Uuid::new_v4().to_string(),
                &n.user_id,
                &n.title,
                &n.message,
                &n.link,
                &now,
            ),
        )?;
    }
    if let Some(signature) = mail_signature {
        let m = mail(event, parties, signature);
        tracing::info!(recipients = m.recipients.len(), subject = %m.subject, "mail queued");
        conn.execute(
            "INSERT INTO outbox(id, recipients, subject, body, created_at) VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                m.recipients.join(", "),
                &m.subject,
                &m.body,
                &now,
            ),
        )?;
    }
    Ok(list.len())
}
