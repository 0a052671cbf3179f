pub mod account;
pub mod pipeline;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A transaction as delivered by ingestion. Never mutated after receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub account_id: String,
    pub amount: f64,
    pub currency: String,
    pub timestamp: DateTime<Utc>,
    pub merchant_category: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub geo_location: Option<String>,
}

/// Categorical risk label. Declaration order is severity order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Low,
    Medium,
    High,
    Critical,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Low => "low",
            Verdict::Medium => "medium",
            Verdict::High => "high",
            Verdict::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Verdict::Low),
            "medium" => Some(Verdict::Medium),
            "high" => Some(Verdict::High),
            "critical" => Some(Verdict::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one rule against one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleHit {
    pub rule_id: String,
    pub matched: bool,
    /// Severity contributed to the fused score (0 when not matched).
    pub severity: f64,
}

/// One entry of the explanation trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExplanationFactor {
    Rule {
        rule_id: String,
        description: String,
        weight: f64,
    },
    RuleCeiling {
        raw_total: f64,
        capped_total: f64,
    },
    Feature {
        name: String,
        weight: f64,
    },
    Degraded {
        reason: String,
    },
}

/// The per-transaction verdict. Created once by fusion, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub transaction_id: String,
    pub account_id: String,
    /// `None` when the scorer was unavailable.
    pub anomaly_score: Option<f64>,
    pub rule_hits: Vec<RuleHit>,
    /// Matched severity total after the ceiling was applied.
    pub rule_contribution: f64,
    pub risk_score: f64, // 0-100
    pub verdict: Verdict,
    pub degraded: bool,
    pub explanation: Vec<ExplanationFactor>,
    pub rule_set_version: u64,
}

impl RiskAssessment {
    pub fn matched_rules(&self) -> impl Iterator<Item = &RuleHit> {
        self.rule_hits.iter().filter(|h| h.matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_ordering() {
        assert!(Verdict::Low < Verdict::Medium);
        assert!(Verdict::High < Verdict::Critical);
        assert_eq!(Verdict::Critical.max(Verdict::Medium), Verdict::Critical);
    }

    #[test]
    fn verdict_parse_roundtrip() {
        for v in [Verdict::Low, Verdict::Medium, Verdict::High, Verdict::Critical] {
            assert_eq!(Verdict::parse(v.as_str()), Some(v));
        }
        assert_eq!(Verdict::parse("severe"), None);
    }

    #[test]
    fn transaction_optional_fields_default() {
        let json = r#"{
            "id": "t1",
            "account_id": "a1",
            "amount": 12.5,
            "currency": "USD",
            "timestamp": "2024-03-01T10:00:00Z",
            "merchant_category": "grocery"
        }"#;
        let tx: Transaction = serde_json::from_str(json).unwrap();
        assert_eq!(tx.device_id, None);
        assert_eq!(tx.geo_location, None);
        assert_eq!(tx.amount, 12.5);
    }

    #[test]
    fn explanation_factor_tagged_json() {
        let f = ExplanationFactor::Degraded { reason: "timeout".into() };
        let json = serde_json::to_string(&f).unwrap();
        assert_eq!(json, r#"{"kind":"degraded","reason":"timeout"}"#);
    }
}
