use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{AnomalyScore, AnomalyScorer, ScoringUnavailable};
use crate::config::ServiceConfig;
use crate::features::FeatureVector;

/// Client for a remote model-serving endpoint.
pub struct ModelServiceScorer {
    url: String,
    client: Client,
    auth: Option<String>, // base64 encoded user:pass
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    features: &'a FeatureVector,
}

#[derive(Deserialize)]
struct ScoreResponse {
    score: f64,
    #[serde(default)]
    contributions: BTreeMap<String, f64>,
}

impl ModelServiceScorer {
    pub fn new(config: &ServiceConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        use base64::{Engine, engine::general_purpose::STANDARD};
        let auth = match (&config.user, &config.password) {
            (Some(user), Some(pass)) => Some(STANDARD.encode(format!("{user}:{pass}"))),
            _ => None,
        };
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: config.url.clone(),
            client,
            auth,
        })
    }
}

impl AnomalyScorer for ModelServiceScorer {
    fn name(&self) -> &str {
        "model_service"
    }

    async fn score(&self, features: &FeatureVector) -> Result<AnomalyScore, ScoringUnavailable> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&ScoreRequest { features });
        if let Some(auth) = &self.auth {
            req = req.header("Authorization", format!("Basic {auth}"));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ScoringUnavailable::new(format!("HTTP error: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ScoringUnavailable::new(format!("model service returned {status}")));
        }
        let body: ScoreResponse = resp
            .json()
            .await
            .map_err(|e| ScoringUnavailable::new(format!("malformed model response: {e}")))?;

        AnomalyScore::normalized(body.score, body.contributions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_requires_both_parts() {
        let mut config = ServiceConfig {
            user: Some("model".into()),
            ..ServiceConfig::default()
        };
        let scorer = ModelServiceScorer::new(&config, Duration::from_millis(100)).unwrap();
        assert!(scorer.auth.is_none());

        config.password = Some("secret".into());
        let scorer = ModelServiceScorer::new(&config, Duration::from_millis(100)).unwrap();
        assert_eq!(scorer.auth.as_deref(), Some("bW9kZWw6c2VjcmV0"));
    }

    #[test]
    fn request_body_shape() {
        let features = FeatureVector::from([("amount", 10.0)]);
        let json = serde_json::to_string(&ScoreRequest { features: &features }).unwrap();
        assert_eq!(json, r#"{"features":{"amount":10.0}}"#);
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        let config = ServiceConfig {
            url: "http://127.0.0.1:9/score".into(),
            ..ServiceConfig::default()
        };
        let scorer = ModelServiceScorer::new(&config, Duration::from_millis(200)).unwrap();
        let err = scorer.score(&FeatureVector::default()).await.unwrap_err();
        assert!(err.reason.starts_with("HTTP error"));
    }
}
