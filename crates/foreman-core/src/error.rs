//! Error taxonomy for the orchestration core.
//!
//! Every failure that reaches a caller is eventually folded into a
//! [`ResultEnvelope`](crate::envelope::ResultEnvelope) with `status = error`;
//! [`ForemanError`] is the in-process form and [`ErrorKind`] the wire form.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::contract::Violation;
use crate::envelope::CompletionPromise;

/// Which side of a contract a validation failure was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Serializable error category attached to error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaValidation,
    WorkerExecution,
    WorkerTimeout,
    OutputKeyCollision,
    LoopExhausted,
    ApprovalTimeout,
    ApprovalRejected,
    Configuration,
    State,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SchemaValidation => "schema_validation",
            Self::WorkerExecution => "worker_execution",
            Self::WorkerTimeout => "worker_timeout",
            Self::OutputKeyCollision => "output_key_collision",
            Self::LoopExhausted => "loop_exhausted",
            Self::ApprovalTimeout => "approval_timeout",
            Self::ApprovalRejected => "approval_rejected",
            Self::Configuration => "configuration",
            Self::State => "state",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Errors produced by the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum ForemanError {
    #[error("{direction} for skill {skill_id} violates its contract: {}", join_violations(.violations))]
    SchemaValidation {
        skill_id: String,
        direction: Direction,
        violations: Vec<Violation>,
    },

    #[error("worker for skill {skill_id} failed: {reason}")]
    WorkerExecution { skill_id: String, reason: String },

    #[error("worker for skill {skill_id} timed out after {}s", secs(.timeout))]
    WorkerTimeout { skill_id: String, timeout: Duration },

    #[error("output key {key:?} is produced by more than one step")]
    OutputKeyCollision { key: String },

    #[error("quality gate exhausted after {iterations} iteration(s): {reason}")]
    LoopExhausted { iterations: u32, reason: String },

    #[error("approval not granted within {}s", secs(.timeout))]
    ApprovalTimeout { timeout: Duration },

    #[error("approval rejected by {approver}: {reason}")]
    ApprovalRejected { approver: String, reason: String },

    #[error("shared state has no value for key {key:?}")]
    MissingKey { key: String },

    #[error("shared state key {key:?} was already written in this run")]
    DuplicateKey { key: String },

    #[error("invalid shared state key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("no contract registered for skill {0}")]
    UnknownSkill(String),

    #[error("skill {0} is already registered with a different contract")]
    ContractConflict(String),

    #[error("no worker registered for skill {0}")]
    MissingWorker(String),

    #[error("worker for skill {0} is already registered")]
    DuplicateWorker(String),

    #[error("invalid composition: {0}")]
    InvalidComposition(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn secs(timeout: &Duration) -> f64 {
    timeout.as_secs_f64()
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ForemanError {
    /// The wire category for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SchemaValidation { .. } | Self::UnknownSkill(_) => ErrorKind::SchemaValidation,
            Self::WorkerExecution { .. } | Self::Transport(_) => ErrorKind::WorkerExecution,
            Self::WorkerTimeout { .. } => ErrorKind::WorkerTimeout,
            Self::OutputKeyCollision { .. } => ErrorKind::OutputKeyCollision,
            Self::LoopExhausted { .. } => ErrorKind::LoopExhausted,
            Self::ApprovalTimeout { .. } => ErrorKind::ApprovalTimeout,
            Self::ApprovalRejected { .. } => ErrorKind::ApprovalRejected,
            Self::MissingKey { .. } | Self::DuplicateKey { .. } | Self::InvalidKey { .. } => {
                ErrorKind::State
            }
            Self::ContractConflict(_)
            | Self::MissingWorker(_)
            | Self::DuplicateWorker(_)
            | Self::InvalidComposition(_)
            | Self::InvalidConfig(_) => ErrorKind::Configuration,
            Self::Serialization(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// The completion promise a run reports when it stops on this error.
    ///
    /// An exhausted loop is the only failure that may still be making
    /// progress; its runner decides between `IN_PROGRESS` and `BLOCKED`.
    pub fn completion_promise(&self) -> CompletionPromise {
        match self {
            Self::LoopExhausted { .. } => CompletionPromise::InProgress,
            _ => CompletionPromise::Blocked,
        }
    }

    /// Whether this failure was detected before any worker could be invoked.
    pub fn is_pre_dispatch(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SchemaValidation | ErrorKind::OutputKeyCollision | ErrorKind::Configuration
        )
    }
}

/// Result type for orchestration operations.
pub type ForemanResult<T> = std::result::Result<T, ForemanError>;
