use serde::{Deserialize, Serialize};

use crate::core::Transaction;
use crate::core::account::AccountState;
use crate::features::{FEATURE_NAMES, FeatureVector};

/// Condition a rule tests. Evaluation is total: every well-formed input
/// yields true or false, and comparisons against NaN are false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// feature > threshold
    FeatureAbove { feature: String, threshold: f64 },
    /// feature >= threshold
    FeatureAtLeast { feature: String, threshold: f64 },
    /// feature < threshold
    FeatureBelow { feature: String, threshold: f64 },
    /// feature != 0
    Flag { feature: String },
    AmountAbove { amount: f64 },
    MerchantCategoryIn { categories: Vec<String> },
    CurrencyNotIn { currencies: Vec<String> },
    /// Fewer than `count` transactions recorded on the account.
    HistoryBelow { count: u64 },
    All { predicates: Vec<Predicate> },
    Any { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn matches(&self, tx: &Transaction, state: &AccountState, features: &FeatureVector) -> bool {
        match self {
            Predicate::FeatureAbove { feature, threshold } => {
                features.get(feature).is_some_and(|v| v > *threshold)
            }
            Predicate::FeatureAtLeast { feature, threshold } => {
                features.get(feature).is_some_and(|v| v >= *threshold)
            }
            Predicate::FeatureBelow { feature, threshold } => {
                features.get(feature).is_some_and(|v| v < *threshold)
            }
            Predicate::Flag { feature } => {
                features.get(feature).is_some_and(|v| v != 0.0 && !v.is_nan())
            }
            Predicate::AmountAbove { amount } => tx.amount > *amount,
            Predicate::MerchantCategoryIn { categories } => {
                categories.iter().any(|c| c.eq_ignore_ascii_case(&tx.merchant_category))
            }
            Predicate::CurrencyNotIn { currencies } => {
                !currencies.iter().any(|c| c.eq_ignore_ascii_case(&tx.currency))
            }
            Predicate::HistoryBelow { count } => state.total_recorded() < *count,
            Predicate::All { predicates } => predicates.iter().all(|p| p.matches(tx, state, features)),
            Predicate::Any { predicates } => predicates.iter().any(|p| p.matches(tx, state, features)),
            Predicate::Not { predicate } => !predicate.matches(tx, state, features),
        }
    }

    /// Reject definitions that could not be evaluated meaningfully.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Predicate::FeatureAbove { feature, threshold }
            | Predicate::FeatureAtLeast { feature, threshold }
            | Predicate::FeatureBelow { feature, threshold } => {
                known_feature(feature)?;
                finite("threshold", *threshold)
            }
            Predicate::Flag { feature } => known_feature(feature),
            Predicate::AmountAbove { amount } => finite("amount", *amount),
            Predicate::MerchantCategoryIn { categories } => non_empty("categories", categories.len()),
            Predicate::CurrencyNotIn { currencies } => non_empty("currencies", currencies.len()),
            Predicate::HistoryBelow { .. } => Ok(()),
            Predicate::All { predicates } | Predicate::Any { predicates } => {
                non_empty("predicates", predicates.len())?;
                predicates.iter().try_for_each(Predicate::validate)
            }
            Predicate::Not { predicate } => predicate.validate(),
        }
    }
}

fn known_feature(name: &str) -> Result<(), String> {
    if FEATURE_NAMES.contains(&name) {
        Ok(())
    } else {
        Err(format!("unknown feature '{name}'"))
    }
}

fn finite(field: &str, value: f64) -> Result<(), String> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(format!("{field} must be finite, got {value}"))
    }
}

fn non_empty(field: &str, len: usize) -> Result<(), String> {
    if len == 0 {
        Err(format!("{field} must not be empty"))
    } else {
        Ok(())
    }
}
