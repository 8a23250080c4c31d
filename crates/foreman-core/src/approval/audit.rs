//! Append-only audit trail of approval decisions.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::decision::ApprovalDecision;
use super::request::ApprovalRequest;
use crate::error::ForemanResult;

/// Immutable record of one approval decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub request_id: String,
    pub task_id: String,
    pub request: ApprovalRequest,
    pub decision: ApprovalDecision,
    pub recorded_at: DateTime<Utc>,
    /// SHA-256 over every other field, hex encoded.
    pub content_digest: String,
}

impl AuditRecord {
    pub fn new(
        task_id: impl Into<String>,
        request: ApprovalRequest,
        decision: ApprovalDecision,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            request,
            decision,
            recorded_at: now,
            content_digest: String::new(),
        };
        record.content_digest = record.compute_digest();
        record
    }

    fn compute_digest(&self) -> String {
        let payload = serde_json::json!({
            "request_id": self.request_id,
            "task_id": self.task_id,
            "request": self.request,
            "decision": {
                "outcome": self.decision.outcome,
                "approver": self.decision.approver,
                "decided_at": self.decision.decided_at.to_rfc3339(),
                "reason": self.decision.reason,
            },
            "recorded_at": self.recorded_at.to_rfc3339(),
        });
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// `false` if any field changed after the record was written.
    pub fn verify_integrity(&self) -> bool {
        self.content_digest == self.compute_digest()
    }
}

/// Thread-safe, append-only list of [`AuditRecord`]s. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<AuditRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(
        &self,
        task_id: &str,
        request: ApprovalRequest,
        decision: ApprovalDecision,
    ) -> AuditRecord {
        let record = AuditRecord::new(task_id, request, decision, Utc::now());
        self.guard().push(record.clone());
        record
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.guard().clone()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Every record's digest still matches its content.
    pub fn verify_integrity(&self) -> bool {
        self.guard().iter().all(AuditRecord::verify_integrity)
    }
}

/// Write audit records to disk as a JSON array.
pub fn write_audit_log(records: &[AuditRecord], path: &Path) -> ForemanResult<()> {
    let json = serde_json::to_string_pretty(records)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Read audit records written by [`write_audit_log`].
pub fn read_audit_log(path: &Path) -> ForemanResult<Vec<AuditRecord>> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::risk::RiskLevel;

    fn request() -> ApprovalRequest {
        ApprovalRequest::new("purge cache", vec!["cdn/assets".into()], RiskLevel::High, 30)
    }

    #[test]
    fn test_append_sets_digest() {
        let log = AuditLog::new();
        let record = log.append("t-1", request(), ApprovalDecision::auto(Utc::now()));
        assert_eq!(record.content_digest.len(), 64);
        assert!(record.verify_integrity());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_tampering_is_detected() {
        let log = AuditLog::new();
        let mut record = log.append("t-1", request(), ApprovalDecision::auto(Utc::now()));
        record.decision.approver = "mallory".into();
        assert!(!record.verify_integrity());
        assert!(log.verify_integrity());
    }

    #[test]
    fn test_clones_share_records() {
        let log = AuditLog::new();
        let other = log.clone();
        other.append("t-1", request(), ApprovalDecision::timed_out(Utc::now()));
        assert_eq!(log.records().len(), 1);
    }

    #[test]
    fn test_write_and_read_audit_log() {
        let log = AuditLog::new();
        log.append("t-1", request(), ApprovalDecision::approved("alice", Utc::now()));
        log.append(
            "t-2",
            request(),
            ApprovalDecision::rejected("bob", "not today", Utc::now()),
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.json");
        write_audit_log(&log.records(), &path).unwrap();
        let loaded = read_audit_log(&path).unwrap();
        assert_eq!(loaded, log.records());
        assert!(loaded.iter().all(AuditRecord::verify_integrity));
    }
}
