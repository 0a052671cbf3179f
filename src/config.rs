use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::core::Verdict;
use crate::features::FEATURE_NAMES;
use crate::rules::{RuleDefinition, RuleSet, catalog};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub features: FeatureConfig,
    pub fusion: FusionConfig,
    pub rules: Vec<RuleDefinition>,
    pub scorer: ScorerConfig,
    pub alerts: AlertConfig,
    pub pipeline: PipelineConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FeatureConfig {
    pub velocity_window_minutes: i64,
    pub long_velocity_window_minutes: i64,
    pub geo_window_hours: i64,
    /// Maximum history entries kept per account.
    pub history_limit: usize,
    /// Below this many recorded transactions the account is cold.
    pub min_history: usize,
    pub min_stddev: f64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    /// Points contributed by an anomaly score of 1.0.
    pub ml_weight: f64,
    /// Points contributed by a saturated rule signal.
    pub rule_weight: f64,
    /// Matched severity total at which the rule signal saturates.
    pub rule_ceiling: f64,
    pub top_k_features: usize,
    /// Highest verdict reachable when the anomaly scorer is unavailable.
    pub degraded_verdict_cap: Verdict,
    pub thresholds: VerdictThresholds,
}

/// Lower bounds (inclusive) of each verdict above `low`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct VerdictThresholds {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScorerKind {
    #[default]
    Logistic,
    Service,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScorerConfig {
    pub kind: ScorerKind,
    pub timeout_ms: u64,
    pub logistic: LogisticConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogisticConfig {
    pub bias: f64,
    pub weights: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AlertConfig {
    /// Assessments at or above this verdict raise an alert.
    pub min_verdict: Verdict,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Bound on a single persistence attempt.
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub shards: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            features: FeatureConfig::default(),
            fusion: FusionConfig::default(),
            rules: catalog::default_rules(),
            scorer: ScorerConfig::default(),
            alerts: AlertConfig::default(),
            pipeline: PipelineConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            velocity_window_minutes: 10,
            long_velocity_window_minutes: 60,
            geo_window_hours: 24,
            history_limit: 200,
            min_history: 3,
            min_stddev: 1.0,
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            ml_weight: 60.0,
            rule_weight: 40.0,
            rule_ceiling: 40.0,
            top_k_features: 3,
            degraded_verdict_cap: Verdict::High,
            thresholds: VerdictThresholds::default(),
        }
    }
}

impl Default for VerdictThresholds {
    fn default() -> Self {
        Self {
            medium: 40.0,
            high: 60.0,
            critical: 80.0,
        }
    }
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            kind: ScorerKind::Logistic,
            timeout_ms: 250,
            logistic: LogisticConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

impl Default for LogisticConfig {
    fn default() -> Self {
        let weights = [
            ("amount_zscore", 0.35),
            ("velocity_short", 0.45),
            ("velocity_long", 0.15),
            ("new_device", 1.2),
            ("new_geo", 1.0),
            ("new_merchant_category", 0.6),
            ("geo_count_window", 0.5),
        ]
        .into_iter()
        .map(|(name, w)| (name.to_string(), w))
        .collect();
        Self { bias: -4.0, weights }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/score".into(),
            user: None,
            password: None,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            min_verdict: Verdict::High,
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            timeout_ms: 2_000,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            queue_capacity: 1024,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/txguard.db".into(),
        }
    }
}

/// Longest accepted feature window (one leap year).
pub const MAX_WINDOW_MINUTES: i64 = 366 * 24 * 60;

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::InvalidFeatures(reason));
        for (name, minutes) in [
            ("velocity_window_minutes", Some(self.velocity_window_minutes)),
            ("long_velocity_window_minutes", Some(self.long_velocity_window_minutes)),
            ("geo_window_hours", self.geo_window_hours.checked_mul(60)),
        ] {
            if !minutes.is_some_and(|m| (1..=MAX_WINDOW_MINUTES).contains(&m)) {
                return invalid(format!(
                    "{name} must be positive and at most {MAX_WINDOW_MINUTES} minutes"
                ));
            }
        }
        if self.history_limit == 0 {
            return invalid("history_limit must be at least 1".into());
        }
        if !self.min_stddev.is_finite() || self.min_stddev <= 0.0 {
            return invalid(format!("min_stddev must be positive, got {}", self.min_stddev));
        }
        Ok(())
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::InvalidFusion(reason));
        for (name, w) in [("ml_weight", self.ml_weight), ("rule_weight", self.rule_weight)] {
            if !w.is_finite() || w < 0.0 {
                return invalid(format!("{name} must be finite and non-negative, got {w}"));
            }
        }
        if !self.rule_ceiling.is_finite() || self.rule_ceiling <= 0.0 {
            return invalid(format!("rule_ceiling must be positive, got {}", self.rule_ceiling));
        }
        let t = &self.thresholds;
        let ordered = 0.0 <= t.medium && t.medium < t.high && t.high < t.critical && t.critical <= 100.0;
        if !ordered {
            return invalid(format!(
                "thresholds must satisfy 0 <= medium < high < critical <= 100, got {}/{}/{}",
                t.medium, t.high, t.critical
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load config from a TOML file. A missing file yields defaults; a file
    /// that cannot be read, parsed or validated is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&contents)?;
        tracing::info!(
            rules = config.rules.len(),
            "Config loaded from {}",
            path.display()
        );
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.features.validate()?;
        self.fusion.validate()?;
        RuleSet::new(self.rules.clone(), 0)?;
        if let Some(name) = self
            .scorer
            .logistic
            .weights
            .keys()
            .find(|name| !FEATURE_NAMES.contains(&name.as_str()))
        {
            return Err(ConfigError::InvalidScorer(format!(
                "logistic weight for unknown feature '{name}'"
            )));
        }
        if self.pipeline.shards == 0 || self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::InvalidPipeline(
                "shards and queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    InvalidRule(#[from] crate::rules::InvalidRuleDefinition),
    #[error("invalid feature config: {0}")]
    InvalidFeatures(String),
    #[error("invalid fusion config: {0}")]
    InvalidFusion(String),
    #[error("invalid scorer config: {0}")]
    InvalidScorer(String),
    #[error("invalid pipeline config: {0}")]
    InvalidPipeline(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.fusion.ml_weight, 60.0);
        assert_eq!(config.alerts.min_verdict, Verdict::High);
        assert!(!config.rules.is_empty());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/txguard.toml").unwrap();
        assert_eq!(config.pipeline.shards, 4);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = Config::from_toml(
            r#"
            [fusion]
            ml_weight = 70.0
            degraded_verdict_cap = "medium"

            [fusion.thresholds]
            critical = 90.0
            "#,
        )
        .unwrap();
        assert_eq!(config.fusion.ml_weight, 70.0);
        assert_eq!(config.fusion.rule_weight, 40.0);
        assert_eq!(config.fusion.degraded_verdict_cap, Verdict::Medium);
        assert_eq!(config.fusion.thresholds.critical, 90.0);
        assert_eq!(config.fusion.thresholds.high, 60.0);
        assert_eq!(config.rules.len(), catalog::default_rules().len());
    }

    #[test]
    fn rules_from_toml_keep_order() {
        let config = Config::from_toml(
            r#"
            [[rules]]
            id = "z_rule"
            description = "large z-score"
            severity = 40.0
            predicate = { kind = "feature_above", feature = "amount_zscore", threshold = 5.0 }

            [[rules]]
            id = "a_rule"
            description = "gambling"
            severity = 10.0
            enabled = false
            predicate = { kind = "merchant_category_in", categories = ["gambling"] }
            "#,
        )
        .unwrap();
        let ids: Vec<_> = config.rules.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["z_rule", "a_rule"]);
        assert!(!config.rules[1].enabled);
    }

    #[test]
    fn malformed_rule_refuses_load() {
        let err = Config::from_toml(
            r#"
            [[rules]]
            id = "bad"
            description = "references a missing feature"
            severity = 10.0
            predicate = { kind = "feature_above", feature = "no_such_feature", threshold = 1.0 }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRule(_)));
    }

    #[test]
    fn out_of_range_windows_refuse_load() {
        for toml in [
            "[features]\ngeo_window_hours = 9223372036854775807",
            "[features]\nvelocity_window_minutes = -5",
            "[features]\nlong_velocity_window_minutes = 0",
            "[features]\nvelocity_window_minutes = 600000",
        ] {
            let err = Config::from_toml(toml).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidFeatures(_)), "{toml}: {err}");
        }
    }

    #[test]
    fn degenerate_feature_settings_rejected() {
        let bad_stddev = FeatureConfig {
            min_stddev: 0.0,
            ..FeatureConfig::default()
        };
        assert!(matches!(bad_stddev.validate(), Err(ConfigError::InvalidFeatures(_))));
        let nan_stddev = FeatureConfig {
            min_stddev: f64::NAN,
            ..FeatureConfig::default()
        };
        assert!(nan_stddev.validate().is_err());
        let no_history = FeatureConfig {
            history_limit: 0,
            ..FeatureConfig::default()
        };
        assert!(no_history.validate().is_err());
        FeatureConfig::default().validate().unwrap();
    }

    #[test]
    fn unordered_thresholds_rejected() {
        let mut fusion = FusionConfig::default();
        fusion.thresholds.high = 30.0;
        assert!(matches!(fusion.validate(), Err(ConfigError::InvalidFusion(_))));
    }

    #[test]
    fn zero_ceiling_rejected() {
        let fusion = FusionConfig {
            rule_ceiling: 0.0,
            ..FusionConfig::default()
        };
        assert!(fusion.validate().is_err());
    }

    #[test]
    fn unknown_logistic_feature_rejected() {
        let err = Config::from_toml(
            r#"
            [scorer.logistic.weights]
            shoe_size = 1.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidScorer(_)));
    }

    #[test]
    fn garbage_is_parse_error() {
        assert!(matches!(
            Config::from_toml("[fusion\nml_weight = "),
            Err(ConfigError::Parse(_))
        ));
    }
}
