use std::collections::BTreeMap;

use super::{AnomalyScore, AnomalyScorer, ScoringUnavailable};
use crate::config::LogisticConfig;
use crate::features::FeatureVector;

/// In-process linear model: `score = sigmoid(bias + sum(w_i * x_i))`.
/// The per-feature terms `w_i * x_i` are the raw contributions.
pub struct LogisticScorer {
    bias: f64,
    weights: BTreeMap<String, f64>,
}

impl LogisticScorer {
    pub fn new(config: &LogisticConfig) -> Self {
        Self {
            bias: config.bias,
            weights: config.weights.clone(),
        }
    }

    pub fn evaluate(&self, features: &FeatureVector) -> Result<AnomalyScore, ScoringUnavailable> {
        let mut contributions = BTreeMap::new();
        let mut logit = self.bias;
        for (name, weight) in &self.weights {
            let value = features
                .get(name)
                .ok_or_else(|| ScoringUnavailable::new(format!("missing feature '{name}'")))?;
            let term = weight * value;
            logit += term;
            contributions.insert(name.clone(), term);
        }
        AnomalyScore::normalized(sigmoid(logit), contributions)
    }
}

impl AnomalyScorer for LogisticScorer {
    fn name(&self) -> &str {
        "logistic"
    }

    async fn score(&self, features: &FeatureVector) -> Result<AnomalyScore, ScoringUnavailable> {
        self.evaluate(features)
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
