use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{entity} cannot move from {from} to {to}")]
    NotAllowed {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },
}

/// Review state shared by project proposals and uploaded documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStatus {
    Pending,
    Validated,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validated => "validated",
            Self::Rejected => "rejected",
        }
    }

    /// Display label the dashboards show.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "En attente",
            Self::Validated => "Validé",
            Self::Rejected => "Rejeté",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let t = s.trim();
        match t.to_ascii_lowercase().as_str() {
            "pending" => return Some(Self::Pending),
            "validated" => return Some(Self::Validated),
            "rejected" => return Some(Self::Rejected),
            _ => {}
        }
        [Self::Pending, Self::Validated, Self::Rejected]
            .into_iter()
            .find(|st| st.label().to_lowercase() == t.to_lowercase())
    }

    /// Only a pending item can be decided; decisions are final.
    pub fn transition(
        self,
        entity: &'static str,
        to: ReviewStatus,
    ) -> Result<ReviewStatus, TransitionError> {
        match (self, to) {
            (Self::Pending, Self::Validated) | (Self::Pending, Self::Rejected) => Ok(to),
            _ => Err(TransitionError::NotAllowed {
                entity,
                from: self.as_str(),
                to: to.as_str(),
            }),
        }
    }
}

pub type ProposalStatus = ReviewStatus;
pub type DocumentStatus = ReviewStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Report,
    Poster,
    Certificate,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::Poster => "poster",
            Self::Certificate => "certificate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" | "rapport" => Some(Self::Report),
            "poster" => Some(Self::Poster),
            "certificate" | "attestation" => Some(Self::Certificate),
            _ => None,
        }
    }

    /// Kinds whose validation can close an internship.
    pub fn completes_internship(self) -> bool {
        matches!(self, Self::Report | Self::Poster | Self::Certificate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternshipStatus {
    Pending,
    InProgress,
    Validated,
    Cancelled,
}

impl InternshipStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Validated => "validated",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "En attente",
            Self::InProgress => "En cours",
            Self::Validated => "Validé",
            Self::Cancelled => "Annulé",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let t = s.trim();
        match t.to_ascii_lowercase().as_str() {
            "pending" | "en_attente" => return Some(Self::Pending),
            "in_progress" | "inprogress" | "en_cours" => return Some(Self::InProgress),
            "validated" | "valide" => return Some(Self::Validated),
            "cancelled" | "canceled" | "annule" => return Some(Self::Cancelled),
            _ => {}
        }
        [
            Self::Pending,
            Self::InProgress,
            Self::Validated,
            Self::Cancelled,
        ]
        .into_iter()
        .find(|st| st.label().to_lowercase() == t.to_lowercase())
    }

    pub fn transition(self, to: InternshipStatus) -> Result<InternshipStatus, TransitionError> {
        if self == to {
            return Ok(to);
        }
        let allowed = match self {
            Self::Pending => matches!(to, Self::InProgress | Self::Validated | Self::Cancelled),
            Self::InProgress => matches!(to, Self::Validated | Self::Cancelled),
            Self::Validated | Self::Cancelled => false,
        };
        if allowed {
            Ok(to)
        } else {
            Err(TransitionError::NotAllowed {
                entity: "internship",
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }
}

/// Status an internship should take given its documents, or None if unchanged.
///
/// An in-progress internship closes as soon as one relevant document is validated.
pub fn promoted_internship_status<I>(current: InternshipStatus, docs: I) -> Option<InternshipStatus>
where
    I: IntoIterator<Item = (DocumentKind, DocumentStatus)>,
{
    if current != InternshipStatus::InProgress {
        return None;
    }
    let has_valid = docs
        .into_iter()
        .any(|(kind, status)| status == ReviewStatus::Validated && kind.completes_internship());
    has_valid.then_some(InternshipStatus::Validated)
}

pub fn report_status<I>(docs: I) -> &'static str
where
    I: IntoIterator<Item = (DocumentKind, DocumentStatus)>,
{
    let submitted = docs
        .into_iter()
        .any(|(kind, status)| kind == DocumentKind::Report && status == ReviewStatus::Validated);
    if submitted {
        "submitted"
    } else {
        "not_submitted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_decisions_only_from_pending() {
        let p = ReviewStatus::Pending;
        assert_eq!(
            p.transition("project", ReviewStatus::Validated),
            Ok(ReviewStatus::Validated)
        );
        assert_eq!(
            p.transition("project", ReviewStatus::Rejected),
            Ok(ReviewStatus::Rejected)
        );
        assert!(ReviewStatus::Validated
            .transition("project", ReviewStatus::Rejected)
            .is_err());
        assert!(ReviewStatus::Rejected
            .transition("document", ReviewStatus::Validated)
            .is_err());
        assert!(ReviewStatus::Pending
            .transition("document", ReviewStatus::Pending)
            .is_err());
    }

    #[test]
    fn review_status_parses_ids_and_labels() {
        assert_eq!(ReviewStatus::parse("pending"), Some(ReviewStatus::Pending));
        assert_eq!(ReviewStatus::parse("Validé"), Some(ReviewStatus::Validated));
        assert_eq!(ReviewStatus::parse(" rejeté "), Some(ReviewStatus::Rejected));
        assert_eq!(ReviewStatus::parse("done"), None);
    }

    #[test]
    fn document_kind_accepts_legacy_names() {
        assert_eq!(DocumentKind::parse("RAPPORT"), Some(DocumentKind::Report));
        assert_eq!(DocumentKind::parse("Attestation"), Some(DocumentKind::Certificate));
        assert_eq!(DocumentKind::parse("poster"), Some(DocumentKind::Poster));
        assert_eq!(DocumentKind::parse("cv"), None);
    }

    #[test]
    fn internship_transitions() {
        use InternshipStatus::*;
        assert_eq!(Pending.transition(InProgress), Ok(InProgress));
        assert_eq!(Pending.transition(Cancelled), Ok(Cancelled));
        assert_eq!(InProgress.transition(Validated), Ok(Validated));
        assert_eq!(Validated.transition(Validated), Ok(Validated));
        assert!(InProgress.transition(Pending).is_err());
        assert!(Validated.transition(InProgress).is_err());
        assert!(Cancelled.transition(Pending).is_err());
    }

    #[test]
    fn internship_status_parses_labels() {
        assert_eq!(
            InternshipStatus::parse("En cours"),
            Some(InternshipStatus::InProgress)
        );
        assert_eq!(
            InternshipStatus::parse("annulé"),
            Some(InternshipStatus::Cancelled)
        );
        assert_eq!(
            InternshipStatus::parse("in_progress"),
            Some(InternshipStatus::InProgress)
        );
    }

    #[test]
    fn promotion_requires_in_progress_and_validated_doc() {
        let docs = vec![
            (DocumentKind::Poster, ReviewStatus::Pending),
            (DocumentKind::Certificate, ReviewStatus::Validated),
        ];
        assert_eq!(
            promoted_internship_status(InternshipStatus::InProgress, docs.clone()),
            Some(InternshipStatus::Validated)
        );
        assert_eq!(
            promoted_internship_status(InternshipStatus::Pending, docs),
            None
        );
        assert_eq!(
            promoted_internship_status(
                InternshipStatus::InProgress,
                vec![(DocumentKind::Report, ReviewStatus::Rejected)]
            ),
            None
        );
    }

    #[test]
    fn report_status_needs_validated_report() {
        assert_eq!(
            report_status(vec![(DocumentKind::Poster, ReviewStatus::Validated)]),
            "not_submitted"
        );
        assert_eq!(
            report_status(vec![(DocumentKind::Report, ReviewStatus::Validated)]),
            "submitted"
        );
    }
}
