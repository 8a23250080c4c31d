//! Risk classification and human approval for gated actions.
//!
//! - **Risk levels**: actions are classified `LOW < MEDIUM < HIGH < CRITICAL`
//!   by a deterministic rule table over the action descriptor and the
//!   resources it touches.
//! - **Approvers**: `HIGH`/`CRITICAL` actions wait on an [`Approver`] under a
//!   finite timeout; lower levels are approved automatically.
//! - **Audit**: every decision, automatic or not, is appended to an
//!   [`AuditLog`] with a tamper-evident digest.

pub mod approver;
pub mod audit;
pub mod decision;
pub mod policy;
pub mod request;
pub mod risk;

pub use approver::{request_approval, Approver, ChannelApprover, PendingApproval, StaticApprover};
pub use audit::{read_audit_log, write_audit_log, AuditLog, AuditRecord};
pub use decision::{ApprovalDecision, ApprovalOutcome};
pub use policy::{RiskAssessment, RiskMatcher, RiskPolicy, RiskRule};
pub use request::ApprovalRequest;
pub use risk::RiskLevel;
