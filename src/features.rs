use std::collections::{BTreeMap, HashSet};

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use crate::config::{FeatureConfig, MAX_WINDOW_MINUTES};
use crate::core::Transaction;
use crate::core::account::AccountState;

/// Every feature the extractor emits, in catalog order.
pub const FEATURE_NAMES: &[&str] = &[
    "amount",
    "amount_zscore",
    "amount_to_mean_ratio",
    "velocity_short",
    "velocity_long",
    "new_device",
    "new_geo",
    "new_merchant_category",
    "geo_count_window",
    "hour_of_day",
    "time_of_day_bucket",
    "seconds_since_last",
];

/// Named numeric features for one transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(BTreeMap<String, f64>);

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn set(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_string(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<const N: usize> From<[(&str, f64); N]> for FeatureVector {
    fn from(pairs: [(&str, f64); N]) -> Self {
        Self(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

/// Whether the account had enough history for history-derived features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryStatus {
    Sufficient,
    /// Soft signal: history-derived features were set to neutral defaults.
    InsufficientHistory { available: usize, required: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub features: FeatureVector,
    pub history: HistoryStatus,
}

/// Derive the feature vector for `tx` from the account history preceding it.
///
/// Never mutates `state`. Cold accounts get neutral history features
/// rather than an error.
pub fn extract(tx: &Transaction, state: &AccountState, config: &FeatureConfig) -> Extraction {
    let mut features = FeatureVector::default();

    features.set("amount", tx.amount);

    let hour = tx.timestamp.hour();
    features.set("hour_of_day", hour as f64);
    features.set("time_of_day_bucket", time_of_day_bucket(hour) as f64);

    let short = window(config.velocity_window_minutes);
    let long = window(config.long_velocity_window_minutes);
    features.set("velocity_short", state.count_within(tx.timestamp, short) as f64);
    features.set("velocity_long", state.count_within(tx.timestamp, long) as f64);

    // Cold start counts every transaction ever recorded, not just the window.
    let available = usize::try_from(state.total_recorded()).unwrap_or(usize::MAX);
    if available < config.min_history {
        for name in [
            "amount_zscore",
            "amount_to_mean_ratio",
            "new_device",
            "new_geo",
            "new_merchant_category",
            "geo_count_window",
            "seconds_since_last",
        ] {
            features.set(name, 0.0);
        }
        return Extraction {
            features,
            history: HistoryStatus::InsufficientHistory {
                available,
                required: config.min_history,
            },
        };
    }

    let (mean, stddev) = state.amount_stats().unwrap_or((0.0, 0.0));
    let floor = config.min_stddev.max(f64::MIN_POSITIVE);
    features.set("amount_zscore", (tx.amount - mean) / stddev.max(floor));
    features.set(
        "amount_to_mean_ratio",
        if mean > 0.0 { tx.amount / mean } else { 0.0 },
    );

    let novel = |known: bool| if known { 0.0 } else { 1.0 };
    features.set(
        "new_device",
        tx.device_id.as_deref().map_or(0.0, |d| novel(state.knows_device(d))),
    );
    features.set(
        "new_geo",
        tx.geo_location.as_deref().map_or(0.0, |g| novel(state.knows_geo(g))),
    );
    features.set(
        "new_merchant_category",
        novel(state.knows_category(&tx.merchant_category)),
    );

    let geo_from = tx.timestamp - window(config.geo_window_hours.saturating_mul(60));
    let mut geos: HashSet<&str> = state
        .history()
        .filter(|e| e.timestamp >= geo_from && e.timestamp <= tx.timestamp)
        .filter_map(|e| e.geo_location.as_deref())
        .collect();
    if let Some(geo) = tx.geo_location.as_deref() {
        geos.insert(geo);
    }
    features.set("geo_count_window", geos.len() as f64);

    let since_last = state
        .last()
        .map(|e| (tx.timestamp - e.timestamp).num_seconds().max(0) as f64)
        .unwrap_or(0.0);
    features.set("seconds_since_last", since_last);

    Extraction {
        features,
        history: HistoryStatus::Sufficient,
    }
}

/// Window length clamped to `[0, MAX_WINDOW_MINUTES]` so timestamp
/// arithmetic cannot overflow.
fn window(minutes: i64) -> chrono::Duration {
    chrono::Duration::try_minutes(minutes.clamp(0, MAX_WINDOW_MINUTES))
        .unwrap_or_else(chrono::Duration::zero)
}

fn time_of_day_bucket(hour: u32) -> u8 {
    match hour {
        0..=5 => 0,
        6..=11 => 1,
        12..=17 => 2,
        _ => 3,
    }
}
