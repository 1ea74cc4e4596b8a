use crate::workflow::ProposalStatus;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Walk open projects in order and give each to its best-ranked eligible chooser.
    BySubject,
    /// Walk students in merit order and give each their best still-open preference.
    ByMerit,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bySubject" => Some(Self::BySubject),
            "byMerit" => Some(Self::ByMerit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BySubject => "bySubject",
            Self::ByMerit => "byMerit",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudentMerit {
    pub id: String,
    pub average: Option<f64>,
    pub merit_rank: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ProjectSlot {
    pub id: String,
    pub status: ProposalStatus,
    pub supervisor_id: Option<String>,
    pub capacity: usize,
}

#[derive(Debug, Clone)]
pub struct Choice {
    pub student_id: String,
    pub project_id: String,
    pub preference: i64,
    pub partner_id: Option<String>,
    pub proposed: bool,
}

impl Choice {
    fn partner(&self) -> Option<&str> {
        self.partner_id
            .as_deref()
            .filter(|p| *p != self.student_id.as_str())
    }

    fn group_size(&self) -> usize {
        1 + usize::from(self.partner().is_some())
    }
}

/// State already committed before a run.
#[derive(Debug, Clone, Default)]
pub struct Taken {
    pub projects: HashSet<String>,
    pub students: HashSet<String>,
    pub supervisor_load: HashMap<String, usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub strategy: Strategy,
    /// Maximum students per supervisor; 0 means unlimited.
    pub supervisor_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Proposal,
    Merit,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposal => "proposal",
            Self::Merit => "merit",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Planned {
    pub project_id: String,
    pub student_id: String,
    pub partner_id: Option<String>,
    pub supervisor_id: Option<String>,
    pub source: Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnknownProject,
    NotValidated,
    ProjectTaken,
    StudentTaken,
    PartnerTaken,
    OverCapacity,
    SupervisorFull,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownProject => "unknown_project",
            Self::NotValidated => "not_validated",
            Self::ProjectTaken => "project_taken",
            Self::StudentTaken => "student_taken",
            Self::PartnerTaken => "partner_taken",
            Self::OverCapacity => "over_capacity",
            Self::SupervisorFull => "supervisor_full",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Skipped {
    pub student_id: Option<String>,
    pub project_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub assignments: Vec<Planned>,
    pub skipped: Vec<Skipped>,
}

/// Higher average first; a missing average ranks after any present one.
fn cmp_average(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.partial_cmp(&x).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn cmp_rank(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

struct Planner<'a> {
    merit: HashMap<&'a str, &'a StudentMerit>,
    projects: HashMap<&'a str, &'a ProjectSlot>,
    taken: Taken,
    opts: Options,
    out: Plan,
}

impl<'a> Planner<'a> {
    fn cmp_students(&self, a: &str, b: &str) -> Ordering {
        let ma = self.merit.get(a);
        let mb = self.merit.get(b);
        cmp_average(ma.and_then(|m| m.average), mb.and_then(|m| m.average))
            .then_with(|| cmp_rank(ma.and_then(|m| m.merit_rank), mb.and_then(|m| m.merit_rank)))
    }

    fn cmp_choices(&self, a: &Choice, b: &Choice) -> Ordering {
        self.cmp_students(&a.student_id, &b.student_id)
            .then_with(|| a.preference.cmp(&b.preference))
            .then_with(|| a.student_id.cmp(&b.student_id))
    }

    fn supervisor_has_room(&self, project: &ProjectSlot, group: usize) -> bool {
        if self.opts.supervisor_capacity == 0 {
            return true;
        }
        let Some(sup) = project.supervisor_id.as_deref() else {
            return true;
        };
        let load = self.taken.supervisor_load.get(sup).copied().unwrap_or(0);
        load + group <= self.opts.supervisor_capacity
    }

    fn check(&self, choice: &Choice, project: &ProjectSlot) -> Result<(), SkipReason> {
        if project.status != ProposalStatus::Validated {
            return Err(SkipReason::NotValidated);
        }
        if self.taken.projects.contains(&project.id) {
            return Err(SkipReason::ProjectTaken);
        }
        if self.taken.students.contains(&choice.student_id) {
            return Err(SkipReason::StudentTaken);
        }
        if let Some(p) = choice.partner() {
            if self.taken.students.contains(p) {
                return Err(SkipReason::PartnerTaken);
            }
        }
        if choice.group_size() > project.capacity.max(1) {
            return Err(SkipReason::OverCapacity);
        }
        if !self.supervisor_has_room(project, choice.group_size()) {
            return Err(SkipReason::SupervisorFull);
        }
        Ok(())
    }

    fn commit(&mut self, choice: &Choice, project: &ProjectSlot, source: Source) {
        self.taken.projects.insert(project.id.clone());
        self.taken.students.insert(choice.student_id.clone());
        if let Some(p) = choice.partner() {
            self.taken.students.insert(p.to_string());
        }
        if let Some(sup) = project.supervisor_id.as_ref() {
            *self.taken.supervisor_load.entry(sup.clone()).or_insert(0) += choice.group_size();
        }
        self.out.assignments.push(Planned {
            project_id: project.id.clone(),
            student_id: choice.student_id.clone(),
            partner_id: choice.partner().map(|s| s.to_string()),
            supervisor_id: project.supervisor_id.clone(),
            source,
        });
    }

    fn skip(&mut self, choice: &Choice, reason: SkipReason) {
        self.out.skipped.push(Skipped {
            student_id: Some(choice.student_id.clone()),
            project_id: choice.project_id.clone(),
            reason,
        });
    }

    fn run_proposals(&mut self, choices: &'a [Choice]) {
        let mut proposals: Vec<&Choice> = choices.iter().filter(|c| c.proposed).collect();
        proposals.sort_by(|a, b| self.cmp_choices(a, b));
        for choice in proposals {
            let Some(project) = self.projects.get(choice.project_id.as_str()).copied() else {
                self.skip(choice, SkipReason::UnknownProject);
                continue;
            };
            match self.check(choice, project) {
                Ok(()) => self.commit(choice, project, Source::Proposal),
                Err(reason) => self.skip(choice, reason),
            }
        }
    }

    fn run_by_subject(&mut self, projects: &'a [ProjectSlot], choices: &'a [Choice]) {
        for project in projects {
            if project.status != ProposalStatus::Validated || self.taken.projects.contains(&project.id)
            {
                continue;
            }
            if !self.supervisor_has_room(project, 1) {
                self.out.skipped.push(Skipped {
                    student_id: None,
                    project_id: project.id.clone(),
                    reason: SkipReason::SupervisorFull,
                });
                continue;
            }
            let mut candidates: Vec<&Choice> = choices
                .iter()
                .filter(|c| c.project_id == project.id)
                .collect();
            candidates.sort_by(|a, b| self.cmp_choices(a, b));
            let best = candidates
                .into_iter()
                .find(|c| self.check(c, project).is_ok());
            if let Some(choice) = best {
                self.commit(choice, project, Source::Merit);
            }
        }
    }

    fn run_by_merit(&mut self, choices: &'a [Choice]) {
        let mut by_student: HashMap<&str, Vec<&Choice>> = HashMap::new();
        for c in choices {
            by_student.entry(c.student_id.as_str()).or_default().push(c);
        }
        let mut order: Vec<&str> = by_student.keys().copied().collect();
        order.sort_by(|a, b| self.cmp_students(a, b).then_with(|| a.cmp(b)));

        for student in order {
            if self.taken.students.contains(student) {
                continue;
            }
            let mut prefs = by_student.remove(student).unwrap_or_default();
            prefs.sort_by_key(|c| c.preference);
            for choice in prefs {
                let Some(project) = self.projects.get(choice.project_id.as_str()).copied() else {
                    continue;
                };
                if self.check(choice, project).is_ok() {
                    self.commit(choice, project, Source::Merit);
                    break;
                }
            }
        }
    }
}

/// Plans the automatic assignment run.
///
/// Student proposals are honored first, then the remaining validated projects are
/// distributed by merit using `opts.strategy`. `taken` is never mutated; the plan only
/// contains new assignments.
pub fn plan(
    students: &[StudentMerit],
    projects: &[ProjectSlot],
    choices: &[Choice],
    taken: &Taken,
    opts: Options,
) -> Plan {
    let mut planner = Planner {
        merit: students.iter().map(|s| (s.id.as_str(), s)).collect(),
        projects: projects.iter().map(|p| (p.id.as_str(), p)).collect(),
        taken: taken.clone(),
        opts,
        out: Plan::default(),
    };

    planner.run_proposals(choices);
    match opts.strategy {
        Strategy::BySubject => planner.run_by_subject(projects, choices),
        Strategy::ByMerit => planner.run_by_merit(choices),
    }
    planner.out
}
