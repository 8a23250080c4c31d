//! Approval decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Approver identity recorded for decisions made without a human.
pub const AUTO_APPROVER: &str = "auto";

/// Approver identity recorded when nobody decided in time.
pub const NO_APPROVER: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalOutcome {
    pub fn is_approved(self) -> bool {
        matches!(self, Self::Approved)
    }
}

impl std::fmt::Display for ApprovalOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// The decision on one approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub outcome: ApprovalOutcome,
    /// Who decided: an operator id, `auto`, or `none`.
    pub approver: String,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approved(approver: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            outcome: ApprovalOutcome::Approved,
            approver: approver.into(),
            decided_at: now,
            reason: None,
        }
    }

    pub fn rejected(approver: impl Into<String>, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            outcome: ApprovalOutcome::Rejected,
            approver: approver.into(),
            decided_at: now,
            reason: Some(reason.into()),
        }
    }

    pub fn timed_out(now: DateTime<Utc>) -> Self {
        Self {
            outcome: ApprovalOutcome::TimedOut,
            approver: NO_APPROVER.to_string(),
            decided_at: now,
            reason: None,
        }
    }

    /// Automatic approval for levels that do not require a human.
    pub fn auto(now: DateTime<Utc>) -> Self {
        Self::approved(AUTO_APPROVER, now)
    }

    pub fn is_approved(&self) -> bool {
        self.outcome.is_approved()
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
