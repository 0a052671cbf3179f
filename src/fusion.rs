use std::cmp::Ordering;

use crate::config::{FusionConfig, VerdictThresholds};
use crate::core::{ExplanationFactor, RiskAssessment, RuleHit, Transaction, Verdict};
use crate::rules::RuleSet;
use crate::scoring::{AnomalyScore, ScoringUnavailable};

impl Verdict {
    /// Map a fused score onto a verdict. A score equal to a threshold
    /// belongs to the higher category.
    pub fn from_score(score: f64, thresholds: &VerdictThresholds) -> Self {
        if score >= thresholds.critical {
            Verdict::Critical
        } else if score >= thresholds.high {
            Verdict::High
        } else if score >= thresholds.medium {
            Verdict::Medium
        } else {
            Verdict::Low
        }
    }
}

/// Combine the anomaly score and rule hits into one assessment.
///
/// Pure: the same inputs always give an equal assessment. `rule_set` only
/// supplies descriptions and the version for the explanation trail.
pub fn fuse(
    tx: &Transaction,
    anomaly: &Result<AnomalyScore, ScoringUnavailable>,
    rule_hits: Vec<RuleHit>,
    rule_set: &RuleSet,
    config: &FusionConfig,
) -> RiskAssessment {
    let mut explanation = Vec::new();

    let raw_total: f64 = rule_hits.iter().filter(|h| h.matched).map(|h| h.severity).sum();
    let capped_total = raw_total.min(config.rule_ceiling);
    let rule_signal = if config.rule_ceiling > 0.0 {
        capped_total / config.rule_ceiling
    } else {
        0.0
    };
    let rule_points = config.rule_weight * rule_signal;

    for hit in rule_hits.iter().filter(|h| h.matched) {
        let description = rule_set
            .get(&hit.rule_id)
            .map(|r| r.description.clone())
            .unwrap_or_default();
        explanation.push(ExplanationFactor::Rule {
            rule_id: hit.rule_id.clone(),
            description,
            weight: hit.severity,
        });
    }
    if raw_total > config.rule_ceiling {
        explanation.push(ExplanationFactor::RuleCeiling {
            raw_total,
            capped_total,
        });
    }

    let (anomaly_score, risk_score, verdict, degraded) = match anomaly {
        Ok(anomaly) => {
            explanation.extend(
                top_contributions(anomaly, config.top_k_features)
                    .into_iter()
                    .map(|(name, weight)| ExplanationFactor::Feature { name, weight }),
            );
            let risk = clamp_score(config.ml_weight * anomaly.score + rule_points);
            (
                Some(anomaly.score),
                risk,
                Verdict::from_score(risk, &config.thresholds),
                false,
            )
        }
        Err(unavailable) => {
            let risk = clamp_score(rule_points);
            let verdict = Verdict::from_score(risk, &config.thresholds).min(config.degraded_verdict_cap);
            explanation.push(ExplanationFactor::Degraded {
                reason: unavailable.reason.clone(),
            });
            (None, risk, verdict, true)
        }
    };

    RiskAssessment {
        transaction_id: tx.id.clone(),
        account_id: tx.account_id.clone(),
        anomaly_score,
        rule_hits,
        rule_contribution: capped_total,
        risk_score,
        verdict,
        degraded,
        explanation,
        rule_set_version: rule_set.version(),
    }
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() { 0.0 } else { score.clamp(0.0, 100.0) }
}

/// Largest contributions by absolute weight, ties broken by feature name.
fn top_contributions(anomaly: &AnomalyScore, k: usize) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = anomaly
        .contributions
        .iter()
        .filter(|(_, w)| **w != 0.0)
        .map(|(name, w)| (name.clone(), *w))
        .collect();
    ranked.sort_by(|(a_name, a), (b_name, b)| {
        b.abs()
            .partial_cmp(&a.abs())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a_name.cmp(b_name))
    });
    ranked.truncate(k);
    ranked
}
