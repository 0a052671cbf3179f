pub mod logistic;
pub mod service;

use std::collections::BTreeMap;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::features::FeatureVector;

pub use logistic::LogisticScorer;
pub use service::ModelServiceScorer;

/// Raised when the model cannot produce a score. Fusion degrades to
/// rule-only scoring instead of failing the transaction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("scoring unavailable: {reason}")]
pub struct ScoringUnavailable {
    pub reason: String,
}

impl ScoringUnavailable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Model output: a score in [0,1] and per-feature contributions whose
/// absolute values sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub score: f64,
    pub contributions: BTreeMap<String, f64>,
}

impl AnomalyScore {
    /// Validate raw model output and sum-normalize its contributions.
    pub fn normalized(
        score: f64,
        raw_contributions: BTreeMap<String, f64>,
    ) -> Result<Self, ScoringUnavailable> {
        if !score.is_finite() {
            return Err(ScoringUnavailable::new(format!("non-finite score {score}")));
        }
        if let Some((name, w)) = raw_contributions.iter().find(|(_, w)| !w.is_finite()) {
            return Err(ScoringUnavailable::new(format!(
                "non-finite contribution {w} for '{name}'"
            )));
        }

        // Rescale by the largest magnitude first so the sum stays finite.
        let max = raw_contributions.values().fold(0.0_f64, |m, w| m.max(w.abs()));
        let contributions = if max > 0.0 {
            let total: f64 = raw_contributions.values().map(|w| (w / max).abs()).sum();
            raw_contributions
                .into_iter()
                .map(|(name, w)| (name, w / max / total))
                .collect()
        } else {
            raw_contributions
                .into_keys()
                .map(|name| (name, 0.0))
                .collect()
        };

        Ok(Self {
            score: score.clamp(0.0, 1.0),
            contributions,
        })
    }
}

/// Black-box anomaly model: features in, score and contributions out.
pub trait AnomalyScorer: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn score(
        &self,
        features: &FeatureVector,
    ) -> impl Future<Output = Result<AnomalyScore, ScoringUnavailable>> + Send;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Deterministic stand-in for a trained model.
    pub(crate) struct StubScorer {
        pub result: Result<AnomalyScore, ScoringUnavailable>,
    }

    impl StubScorer {
        pub(crate) fn fixed(score: f64, contributions: &[(&str, f64)]) -> Self {
            let raw = contributions.iter().map(|(k, v)| (k.to_string(), *v)).collect();
            Self {
                result: AnomalyScore::normalized(score, raw),
            }
        }

        pub(crate) fn failing(reason: &str) -> Self {
            Self {
                result: Err(ScoringUnavailable::new(reason)),
            }
        }
    }

    impl AnomalyScorer for StubScorer {
        fn name(&self) -> &str {
            "stub"
        }

        async fn score(&self, _features: &FeatureVector) -> Result<AnomalyScore, ScoringUnavailable> {
            self.result.clone()
        }
    }

    fn raw(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn contributions_sum_normalize() {
        let s = AnomalyScore::normalized(0.5, raw(&[("a", 3.0), ("b", -1.0)])).unwrap();
        assert!((s.contributions["a"] - 0.75).abs() < 1e-12);
        assert!((s.contributions["b"] + 0.25).abs() < 1e-12);
        let total: f64 = s.contributions.values().map(|w| w.abs()).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn all_zero_contributions_stay_zero() {
        let s = AnomalyScore::normalized(0.2, raw(&[("a", 0.0)])).unwrap();
        assert_eq!(s.contributions["a"], 0.0);
    }

    #[test]
    fn huge_contributions_normalize_without_overflow() {
        let s = AnomalyScore::normalized(0.9, raw(&[("a", f64::MAX), ("b", -f64::MAX)])).unwrap();
        assert_eq!(s.contributions["a"], 0.5);
        assert_eq!(s.contributions["b"], -0.5);
    }

    #[test]
    fn score_is_clamped() {
        assert_eq!(AnomalyScore::normalized(1.7, BTreeMap::new()).unwrap().score, 1.0);
        assert_eq!(AnomalyScore::normalized(-0.2, BTreeMap::new()).unwrap().score, 0.0);
    }

    #[test]
    fn nan_is_unavailable() {
        assert!(AnomalyScore::normalized(f64::NAN, BTreeMap::new()).is_err());
        assert!(AnomalyScore::normalized(0.5, raw(&[("a", f64::INFINITY)])).is_err());
    }
}
