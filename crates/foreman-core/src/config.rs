//! Runtime configuration for a [`Foreman`](crate::Foreman).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ForemanError, ForemanResult};

/// How a fan-out treats branch failures once the aggregator has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Any failed branch blocks the run unless the aggregator result carries
    /// `"accept_partial": true`.
    #[default]
    RequireAll,
    /// The aggregator's result is final even when branches failed.
    AllowPartial,
}

/// Timeouts and concurrency limits shared by every runner of a foreman.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    /// Deadline for a single worker call.
    #[serde(with = "duration_secs")]
    pub worker_timeout: Duration,
    /// How long an approval gate waits for a decision when no risk rule sets
    /// its own timeout.
    #[serde(with = "duration_secs")]
    pub approval_timeout: Duration,
    /// Upper bound on concurrently running fan-out branches. `None` is unbounded.
    pub max_concurrency: Option<usize>,
    pub aggregation: AggregationPolicy,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(120),
            approval_timeout: Duration::from_secs(300),
            max_concurrency: None,
            aggregation: AggregationPolicy::RequireAll,
        }
    }
}

impl ForemanConfig {
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_aggregation(mut self, policy: AggregationPolicy) -> Self {
        self.aggregation = policy;
        self
    }

    /// # Errors
    ///
    /// [`ForemanError::InvalidConfig`] for a zero timeout or a zero
    /// concurrency limit.
    pub fn validate(&self) -> ForemanResult<()> {
        if self.worker_timeout.is_zero() {
            return Err(ForemanError::InvalidConfig(
                "worker_timeout must be greater than zero".into(),
            ));
        }
        if self.approval_timeout.is_zero() {
            return Err(ForemanError::InvalidConfig(
                "approval_timeout must be greater than zero".into(),
            ));
        }
        if self.max_concurrency == Some(0) {
            return Err(ForemanError::InvalidConfig(
                "max_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let cfg = ForemanConfig::default();
        assert_eq!(cfg.worker_timeout, Duration::from_secs(120));
        assert_eq!(cfg.approval_timeout, Duration::from_secs(300));
        assert_eq!(cfg.max_concurrency, None);
        assert_eq!(cfg.aggregation, AggregationPolicy::RequireAll);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: ForemanConfig =
            serde_json::from_value(json!({"worker_timeout": 5, "aggregation": "allow_partial"}))
                .unwrap();
        assert_eq!(cfg.worker_timeout, Duration::from_secs(5));
        assert_eq!(cfg.approval_timeout, Duration::from_secs(300));
        assert_eq!(cfg.aggregation, AggregationPolicy::AllowPartial);
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let cfg = ForemanConfig::default().with_worker_timeout(Duration::ZERO);
        assert!(matches!(cfg.validate(), Err(ForemanError::InvalidConfig(_))));
        let cfg = ForemanConfig::default().with_approval_timeout(Duration::ZERO);
        assert!(cfg.validate().is_err());
        let cfg = ForemanConfig::default().with_max_concurrency(0);
        assert!(cfg.validate().is_err());
    }
}
