//! Approval requests.

use serde::{Deserialize, Serialize};

use super::risk::RiskLevel;

/// What an approver is asked to decide on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Resolved action descriptor, e.g. `delete table users`.
    pub action: String,
    #[serde(default)]
    pub resources: Vec<String>,
    pub risk_level: RiskLevel,
    pub timeout_seconds: u64,
}

impl ApprovalRequest {
    pub fn new(action: impl Into<String>, resources: Vec<String>, risk_level: RiskLevel, timeout_seconds: u64) -> Self {
        Self {
            action: action.into(),
            resources,
            risk_level,
            timeout_seconds,
        }
    }
}
