pub mod catalog;
pub mod predicate;

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::core::account::AccountState;
use crate::core::{RuleHit, Transaction};
use crate::features::FeatureVector;

pub use predicate::Predicate;

/// A configured detection rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    pub description: String,
    pub predicate: Predicate,
    pub severity: f64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl RuleDefinition {
    pub fn new(id: &str, description: &str, severity: f64, predicate: Predicate) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            predicate,
            severity,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid rule definition '{rule_id}': {reason}")]
pub struct InvalidRuleDefinition {
    pub rule_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    #[error(transparent)]
    Invalid(#[from] InvalidRuleDefinition),
    #[error("unknown rule '{0}'")]
    UnknownRule(String),
}

/// Validated, immutable, ordered rule list.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    rules: Vec<RuleDefinition>,
    version: u64,
}

impl RuleSet {
    /// Validate every definition; a single malformed rule rejects the set.
    pub fn new(rules: Vec<RuleDefinition>, version: u64) -> Result<Self, InvalidRuleDefinition> {
        let mut seen = HashSet::new();
        for rule in &rules {
            let invalid = |reason: String| InvalidRuleDefinition {
                rule_id: rule.id.clone(),
                reason,
            };
            if rule.id.trim().is_empty() {
                return Err(invalid("rule id must not be empty".into()));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(invalid("duplicate rule id".into()));
            }
            if !rule.severity.is_finite() || rule.severity < 0.0 {
                return Err(invalid(format!(
                    "severity must be finite and non-negative, got {}",
                    rule.severity
                )));
            }
            rule.predicate.validate().map_err(invalid)?;
        }
        Ok(Self { rules, version })
    }

    pub fn rules(&self) -> &[RuleDefinition] {
        &self.rules
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, id: &str) -> Option<&RuleDefinition> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn enabled_count(&self) -> usize {
        self.rules.iter().filter(|r| r.enabled).count()
    }
}

/// Evaluate enabled rules in configured order.
pub fn evaluate(
    tx: &Transaction,
    state: &AccountState,
    features: &FeatureVector,
    rule_set: &RuleSet,
) -> Vec<RuleHit> {
    rule_set
        .rules()
        .iter()
        .filter(|rule| rule.enabled)
        .map(|rule| {
            let matched = rule.predicate.matches(tx, state, features);
            RuleHit {
                rule_id: rule.id.clone(),
                matched,
                severity: if matched { rule.severity } else { 0.0 },
            }
        })
        .collect()
}

/// Shared reference to the active rule set. Readers take a snapshot;
/// administrative changes build a new validated set and swap it in.
#[derive(Debug, Clone)]
pub struct RuleSetHandle {
    current: Arc<RwLock<Arc<RuleSet>>>,
}

impl RuleSetHandle {
    pub fn new(rule_set: RuleSet) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(rule_set))),
        }
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Swap in a new rule list. On validation failure the active set is kept.
    pub fn replace(&self, rules: Vec<RuleDefinition>) -> Result<u64, RuleError> {
        self.update(|_| Ok(rules))
    }

    pub fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<u64, RuleError> {
        self.update(|current| {
            let mut rules = current.rules().to_vec();
            find_mut(&mut rules, rule_id)?.enabled = enabled;
            Ok(rules)
        })
    }

    pub fn set_severity(&self, rule_id: &str, severity: f64) -> Result<u64, RuleError> {
        self.update(|current| {
            let mut rules = current.rules().to_vec();
            find_mut(&mut rules, rule_id)?.severity = severity;
            Ok(rules)
        })
    }

    fn update(
        &self,
        change: impl FnOnce(&RuleSet) -> Result<Vec<RuleDefinition>, RuleError>,
    ) -> Result<u64, RuleError> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let rules = change(&guard)?;
        let next = RuleSet::new(rules, guard.version() + 1)?;
        let version = next.version();
        *guard = Arc::new(next);
        tracing::info!(version, rules = guard.rules().len(), "Rule set swapped");
        Ok(version)
    }
}

fn find_mut<'a>(rules: &'a mut [RuleDefinition], id: &str) -> Result<&'a mut RuleDefinition, RuleError> {
    rules
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or_else(|| RuleError::UnknownRule(id.to_string()))
}
