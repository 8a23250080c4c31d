//! Foreman Core Library
//!
//! Contracts, run-scoped shared state and the composition runners a foreman
//! uses to delegate tasks to opaque workers.

pub mod approval;
pub mod config;
pub mod contract;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod persistence;
pub mod runner;
pub mod state;
pub mod telemetry;
pub mod worker;

pub use approval::{
    read_audit_log, request_approval, write_audit_log, ApprovalDecision, ApprovalOutcome,
    ApprovalRequest, Approver, AuditLog, AuditRecord, ChannelApprover, PendingApproval,
    RiskAssessment, RiskLevel, RiskMatcher, RiskPolicy, RiskRule, StaticApprover,
};
pub use config::{AggregationPolicy, ForemanConfig};
pub use contract::{ContractRegistry, FieldShape, FieldSpec, Schema, Violation, WorkerContract};
pub use envelope::{
    CompletionPromise, EnvelopeStatus, ResultEnvelope, StepRecord, TaskEnvelope, Verdict,
    VerdictStatus,
};
pub use error::{Direction, ErrorKind, ForemanError, ForemanResult};
pub use orchestrator::{Composition, Foreman, ForemanBuilder};
pub use persistence::{AttemptStore, FsAttemptStore, MemoryAttemptStore};
pub use runner::approval::approval_decision;
pub use runner::{
    ActionDescriptor, ApprovalGate, LoopReport, LoopState, LoopTransition, ParallelFanOut,
    QualityGateLoop, Resume, RunContext, SequentialPipeline,
};
pub use state::{SharedState, INPUT_KEY, MISSING_MARKER};
pub use telemetry::init_tracing;
pub use worker::{Dispatcher, FnWorker, Step, Worker, WorkerSet};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
