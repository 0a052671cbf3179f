use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AlertConfig;
use crate::core::{ExplanationFactor, RiskAssessment, Verdict};

/// Alert creation request handed to the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub transaction_id: String,
    pub account_id: String,
    pub verdict: Verdict,
    pub risk_score: f64,
    pub degraded: bool,
    pub explanation: Vec<ExplanationFactor>,
    pub rule_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn from_assessment(assessment: &RiskAssessment, created_at: DateTime<Utc>) -> Self {
        Self {
            transaction_id: assessment.transaction_id.clone(),
            account_id: assessment.account_id.clone(),
            verdict: assessment.verdict,
            risk_score: assessment.risk_score,
            degraded: assessment.degraded,
            explanation: assessment.explanation.clone(),
            rule_ids: assessment.matched_rules().map(|h| h.rule_id.clone()).collect(),
            created_at,
        }
    }

    /// Severity of each matched rule, as recorded in the explanation.
    pub fn rule_severities(&self) -> impl Iterator<Item = (&str, f64)> {
        self.explanation.iter().filter_map(|f| match f {
            ExplanationFactor::Rule {
                rule_id, weight, ..
            } => Some((rule_id.as_str(), *weight)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Created(i64),
    /// An alert for the same transaction was already stored.
    AlreadyExists(i64),
}

impl PersistOutcome {
    pub fn alert_id(&self) -> i64 {
        match self {
            PersistOutcome::Created(id) | PersistOutcome::AlreadyExists(id) => *id,
        }
    }
}

/// Persistence collaborator. Implementations must be idempotent on
/// transaction id, since a retried attempt may already have landed.
pub trait AlertSink: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn persist(&self, alert: &Alert) -> impl Future<Output = Result<PersistOutcome, Self::Error>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertOutcome {
    BelowThreshold,
    Persisted(PersistOutcome),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlertError {
    #[error("failed to persist alert for {transaction_id} after {attempts} attempts: {last_error}")]
    PersistenceFailure {
        transaction_id: String,
        attempts: u32,
        last_error: String,
    },
}

/// Turns high-risk assessments into persisted alerts.
pub struct AlertManager<A> {
    sink: A,
    config: AlertConfig,
}

impl<A: AlertSink> AlertManager<A> {
    pub fn new(sink: A, config: AlertConfig) -> Self {
        Self { sink, config }
    }

    pub fn sink(&self) -> &A {
        &self.sink
    }

    pub async fn dispatch(&self, assessment: &RiskAssessment) -> Result<AlertOutcome, AlertError> {
        if assessment.verdict < self.config.min_verdict {
            return Ok(AlertOutcome::BelowThreshold);
        }

        let alert = Alert::from_assessment(assessment, Utc::now());
        let attempts = self.config.max_attempts.max(1);
        let per_attempt = Duration::from_millis(self.config.timeout_ms);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.delay_for_attempt(attempt - 1)).await;
            }
            match tokio::time::timeout(per_attempt, self.sink.persist(&alert)).await {
                Ok(Ok(outcome)) => {
                    tracing::info!(
                        transaction_id = %alert.transaction_id,
                        verdict = %alert.verdict,
                        risk_score = alert.risk_score,
                        alert_id = outcome.alert_id(),
                        "Alert persisted"
                    );
                    return Ok(AlertOutcome::Persisted(outcome));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("persist timed out after {}ms", self.config.timeout_ms),
            }
            tracing::warn!(
                transaction_id = %alert.transaction_id,
                attempt = attempt + 1,
                error = %last_error,
                "Alert persist attempt failed"
            );
        }

        tracing::error!(
            transaction_id = %alert.transaction_id,
            attempts,
            "Giving up on alert persistence"
        );
        Err(AlertError::PersistenceFailure {
            transaction_id: alert.transaction_id,
            attempts,
            last_error,
        })
    }

    /// Delay before retry number `retry` (0-based): initial · 2^retry, capped.
    fn delay_for_attempt(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let ms = self
            .config
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::RuleHit;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    pub(crate) struct SinkError(pub String);

    /// In-memory sink that fails the first `failures` calls.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub failures: AtomicU32,
        pub calls: AtomicU32,
        pub stored: Mutex<HashMap<String, Alert>>,
    }

    impl MemorySink {
        pub(crate) fn flaky(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                ..Default::default()
            }
        }
    }

    impl AlertSink for MemorySink {
        type Error = SinkError;

        async fn persist(&self, alert: &Alert) -> Result<PersistOutcome, SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SinkError("database is locked".into()));
            }
            let mut stored = self.stored.lock().unwrap();
            let next_id = stored.len() as i64 + 1;
            if stored.contains_key(&alert.transaction_id) {
                return Ok(PersistOutcome::AlreadyExists(next_id - 1));
            }
            stored.insert(alert.transaction_id.clone(), alert.clone());
            Ok(PersistOutcome::Created(next_id))
        }
    }

    struct HangingSink;

    impl AlertSink for HangingSink {
        type Error = SinkError;

        async fn persist(&self, _alert: &Alert) -> Result<PersistOutcome, SinkError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(PersistOutcome::Created(1))
        }
    }

    fn fast_config() -> AlertConfig {
        AlertConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            timeout_ms: 50,
            ..AlertConfig::default()
        }
    }

    fn assessment(verdict: Verdict) -> RiskAssessment {
        RiskAssessment {
            transaction_id: "tx-1".into(),
            account_id: "acct-1".into(),
            anomaly_score: Some(0.9),
            rule_hits: vec![
                RuleHit {
                    rule_id: "amount_zscore_gt_5".into(),
                    matched: true,
                    severity: 40.0,
                },
                RuleHit {
                    rule_id: "new_geo".into(),
                    matched: false,
                    severity: 0.0,
                },
            ],
            rule_contribution: 40.0,
            risk_score: 94.0,
            verdict,
            degraded: false,
            explanation: vec![ExplanationFactor::Rule {
                rule_id: "amount_zscore_gt_5".into(),
                description: "z".into(),
                weight: 40.0,
            }],
            rule_set_version: 0,
        }
    }

    #[test]
    fn alert_carries_matched_rules_only() {
        let alert = Alert::from_assessment(&assessment(Verdict::Critical), Utc::now());
        assert_eq!(alert.rule_ids, ["amount_zscore_gt_5"]);
        assert_eq!(alert.rule_severities().collect::<Vec<_>>(), [("amount_zscore_gt_5", 40.0)]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let manager = AlertManager::new(
            MemorySink::default(),
            AlertConfig {
                initial_backoff_ms: 100,
                max_backoff_ms: 350,
                ..AlertConfig::default()
            },
        );
        assert_eq!(manager.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(manager.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(manager.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(manager.delay_for_attempt(80), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn below_threshold_skips_sink() {
        let manager = AlertManager::new(MemorySink::default(), fast_config());
        let outcome = manager.dispatch(&assessment(Verdict::Medium)).await.unwrap();
        assert_eq!(outcome, AlertOutcome::BelowThreshold);
        assert_eq!(manager.sink().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn threshold_is_inclusive() {
        let manager = AlertManager::new(MemorySink::default(), fast_config());
        let outcome = manager.dispatch(&assessment(Verdict::High)).await.unwrap();
        assert_eq!(outcome, AlertOutcome::Persisted(PersistOutcome::Created(1)));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let manager = AlertManager::new(MemorySink::flaky(2), fast_config());
        let outcome = manager.dispatch(&assessment(Verdict::Critical)).await.unwrap();
        assert_eq!(outcome, AlertOutcome::Persisted(PersistOutcome::Created(1)));
        assert_eq!(manager.sink().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_persistence_failure() {
        let manager = AlertManager::new(MemorySink::flaky(10), fast_config());
        let err = manager.dispatch(&assessment(Verdict::Critical)).await.unwrap_err();
        assert_eq!(
            err,
            AlertError::PersistenceFailure {
                transaction_id: "tx-1".into(),
                attempts: 3,
                last_error: "database is locked".into(),
            }
        );
        assert_eq!(manager.sink().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_sink_times_out_each_attempt() {
        let config = AlertConfig {
            max_attempts: 2,
            timeout_ms: 10,
            ..fast_config()
        };
        let manager = AlertManager::new(HangingSink, config);
        let err = manager.dispatch(&assessment(Verdict::Critical)).await.unwrap_err();
        let AlertError::PersistenceFailure {
            attempts, last_error, ..
        } = err;
        assert_eq!(attempts, 2);
        assert!(last_error.contains("timed out"));
    }

    #[tokio::test]
    async fn redispatch_is_idempotent() {
        let manager = AlertManager::new(MemorySink::default(), fast_config());
        let a = assessment(Verdict::Critical);
        manager.dispatch(&a).await.unwrap();
        let second = manager.dispatch(&a).await.unwrap();
        assert_eq!(second, AlertOutcome::Persisted(PersistOutcome::AlreadyExists(1)));
        assert_eq!(manager.sink().stored.lock().unwrap().len(), 1);
    }
}
