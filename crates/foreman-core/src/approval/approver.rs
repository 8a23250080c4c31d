//! Approver seam and built-in approvers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::decision::{ApprovalDecision, ApprovalOutcome, NO_APPROVER};
use super::request::ApprovalRequest;
use crate::error::{ForemanError, ForemanResult};

/// Source of approval decisions, typically a human behind some front-end.
#[async_trait]
pub trait Approver: Send + Sync {
    /// Produce a decision for `request`. May wait indefinitely; the caller
    /// enforces the deadline.
    async fn decide(&self, request: &ApprovalRequest) -> ForemanResult<ApprovalDecision>;
}

/// Ask `approver` for a decision, waiting at most `timeout`.
///
/// Fails closed: an elapsed deadline yields `timed_out`, and an approver
/// error yields `rejected` with approver `none`.
pub async fn request_approval(
    approver: &dyn Approver,
    request: &ApprovalRequest,
    timeout: Duration,
) -> ApprovalDecision {
    match tokio::time::timeout(timeout, approver.decide(request)).await {
        Ok(Ok(decision)) => decision,
        Ok(Err(e)) => {
            warn!(action = %request.action, error = %e, "approver failed; treating as rejection");
            ApprovalDecision::rejected(NO_APPROVER, format!("approver unavailable: {e}"), Utc::now())
        }
        Err(_) => ApprovalDecision::timed_out(Utc::now()),
    }
}

/// Answers every request with the same outcome, optionally after a delay.
#[derive(Debug, Clone)]
pub struct StaticApprover {
    approver: String,
    outcome: ApprovalOutcome,
    reason: Option<String>,
    delay: Duration,
}

impl StaticApprover {
    pub fn approving(approver: impl Into<String>) -> Self {
        Self {
            approver: approver.into(),
            outcome: ApprovalOutcome::Approved,
            reason: None,
            delay: Duration::ZERO,
        }
    }

    pub fn rejecting(approver: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            approver: approver.into(),
            outcome: ApprovalOutcome::Rejected,
            reason: Some(reason.into()),
            delay: Duration::ZERO,
        }
    }

    /// Wait this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Approver for StaticApprover {
    async fn decide(&self, _request: &ApprovalRequest) -> ForemanResult<ApprovalDecision> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let now = Utc::now();
        Ok(match self.outcome {
            ApprovalOutcome::Approved => ApprovalDecision::approved(&self.approver, now),
            ApprovalOutcome::Rejected => ApprovalDecision::rejected(
                &self.approver,
                self.reason.clone().unwrap_or_else(|| "rejected".into()),
                now,
            ),
            ApprovalOutcome::TimedOut => ApprovalDecision::timed_out(now),
        })
    }
}

/// A request waiting for a decision from a [`ChannelApprover`] consumer.
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    reply: oneshot::Sender<ApprovalDecision>,
}

impl PendingApproval {
    /// Send `decision` back. Returns `false` if the requester stopped
    /// waiting (timed out).
    pub fn respond(self, decision: ApprovalDecision) -> bool {
        self.reply.send(decision).is_ok()
    }

    pub fn approve(self, approver: impl Into<String>) -> bool {
        self.respond(ApprovalDecision::approved(approver, Utc::now()))
    }

    pub fn reject(self, approver: impl Into<String>, reason: impl Into<String>) -> bool {
        self.respond(ApprovalDecision::rejected(approver, reason, Utc::now()))
    }
}

/// Forwards requests to an async consumer over a channel.
///
/// The receiving half is handed to whatever front-end collects decisions
/// (a prompt, a chat bot, a web hook).
#[derive(Debug, Clone)]
pub struct ChannelApprover {
    tx: mpsc::Sender<PendingApproval>,
}

impl ChannelApprover {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Approver for ChannelApprover {
    async fn decide(&self, request: &ApprovalRequest) -> ForemanResult<ApprovalDecision> {
        let (reply, decision) = oneshot::channel();
        self.tx
            .send(PendingApproval {
                request: request.clone(),
                reply,
            })
            .await
            .map_err(|_| ForemanError::Transport("approval channel closed".into()))?;
        decision
            .await
            .map_err(|_| ForemanError::Transport("approval request dropped without a decision".into()))
    }
}
