//! Wire types exchanged at the orchestration boundary.
//!
//! A [`TaskEnvelope`] is immutable once created. A [`ResultEnvelope`] is
//! produced exactly once per execution attempt and carries the per-step
//! [`StepRecord`]s that a later attempt resumes from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::Violation;
use crate::error::{ErrorKind, ForemanError};

/// A unit of work submitted to a worker or a composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Caller-supplied id, stable across retries of the same logical task.
    pub task_id: String,
    /// Selects the contract (and, for top-level tasks, the composition).
    pub skill_id: String,
    /// Payload conforming to the skill's input schema.
    #[serde(default)]
    pub input: Value,
    /// Prior outcome for the same `task_id`, consulted for resumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_attempt: Option<Box<ResultEnvelope>>,
}

impl TaskEnvelope {
    pub fn new(task_id: impl Into<String>, skill_id: impl Into<String>, input: Value) -> Self {
        Self {
            task_id: task_id.into(),
            skill_id: skill_id.into(),
            input,
            previous_attempt: None,
        }
    }

    pub fn with_previous_attempt(mut self, previous: ResultEnvelope) -> Self {
        self.previous_attempt = Some(Box::new(previous));
        self
    }
}

/// `success | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Success,
    Error,
}

/// Whether further orchestration is needed for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionPromise {
    Complete,
    InProgress,
    Blocked,
}

impl std::fmt::Display for CompletionPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "COMPLETE"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Blocked => write!(f, "BLOCKED"),
        }
    }
}

/// Outcome of one step inside a composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub output_key: String,
    pub skill_id: String,
    pub status: EnvelopeStatus,
    pub completion_promise: CompletionPromise,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StepRecord {
    /// Build a record from the envelope a step produced.
    pub fn from_envelope(
        output_key: impl Into<String>,
        skill_id: impl Into<String>,
        envelope: &ResultEnvelope,
    ) -> Self {
        Self {
            output_key: output_key.into(),
            skill_id: skill_id.into(),
            status: envelope.status,
            completion_promise: envelope.completion_promise,
            result: envelope.result.clone(),
            reason: envelope.reason.clone(),
        }
    }

    /// A step is reusable by a later attempt only if it succeeded and
    /// declared itself complete.
    pub fn is_complete(&self) -> bool {
        self.status == EnvelopeStatus::Success
            && self.completion_promise == CompletionPromise::Complete
            && self.result.is_some()
    }
}

/// The outcome of executing a [`TaskEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub status: EnvelopeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub completion_promise: CompletionPromise,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ResultEnvelope {
    /// Successful, complete result.
    pub fn success(result: Value) -> Self {
        Self {
            task_id: None,
            status: EnvelopeStatus::Success,
            result: Some(result),
            reason: None,
            completion_promise: CompletionPromise::Complete,
            error_kind: None,
            steps: Vec::new(),
            metadata: None,
        }
    }

    /// Successful partial result; the caller should iterate again.
    pub fn in_progress(result: Value) -> Self {
        Self {
            completion_promise: CompletionPromise::InProgress,
            ..Self::success(result)
        }
    }

    /// Error result with an explicit completion promise.
    pub fn error(reason: impl Into<String>, completion_promise: CompletionPromise) -> Self {
        Self {
            task_id: None,
            status: EnvelopeStatus::Error,
            result: None,
            reason: Some(reason.into()),
            completion_promise,
            error_kind: None,
            steps: Vec::new(),
            metadata: None,
        }
    }

    /// Error result that needs external intervention.
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self::error(reason, CompletionPromise::Blocked)
    }

    /// Fold a core error into its wire form.
    pub fn from_error(err: &ForemanError) -> Self {
        Self::error(err.to_string(), err.completion_promise()).with_error_kind(err.kind())
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn with_steps(mut self, steps: Vec<StepRecord>) -> Self {
        self.steps = steps;
        self
    }

    /// Insert `key` into the metadata object, creating it if needed.
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        let mut map = match self.metadata.take() {
            Some(Value::Object(map)) => map,
            Some(other) => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
            None => serde_json::Map::new(),
        };
        map.insert(key.to_string(), value);
        self.metadata = Some(Value::Object(map));
        self
    }

    pub fn metadata_field(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }

    pub fn is_success(&self) -> bool {
        self.status == EnvelopeStatus::Success
    }

    pub fn is_complete(&self) -> bool {
        self.is_success() && self.completion_promise == CompletionPromise::Complete
    }

    /// Check the structural invariants every envelope must satisfy,
    /// independent of any skill schema.
    pub fn validate_shape(&self) -> Result<(), Vec<Violation>> {
        let mut violations = Vec::new();
        match self.status {
            EnvelopeStatus::Success => {
                if self.result.is_none() {
                    violations.push(Violation::new(
                        "result",
                        "required when status is success",
                    ));
                }
                if self.completion_promise == CompletionPromise::Blocked {
                    violations.push(Violation::new(
                        "completion_promise",
                        "BLOCKED requires status error",
                    ));
                }
            }
            EnvelopeStatus::Error => {
                if self.reason.as_deref().map_or(true, |r| r.trim().is_empty()) {
                    violations.push(Violation::new(
                        "reason",
                        "required when status is error",
                    ));
                }
                if self.completion_promise == CompletionPromise::Complete {
                    violations.push(Violation::new(
                        "completion_promise",
                        "COMPLETE cannot accompany status error",
                    ));
                }
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// Critic verdict status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Pass,
    Fail,
}

/// Parsed critic verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// `Some(false)` marks a failure the generator cannot fix by retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            status: VerdictStatus::Pass,
            reason: None,
            recoverable: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Fail,
            reason: Some(reason.into()),
            recoverable: None,
        }
    }

    pub fn is_pass(&self) -> bool {
        self.status == VerdictStatus::Pass
    }
}
