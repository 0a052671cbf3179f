//! Explainable transaction risk scoring.
//!
//! Each transaction is turned into a feature vector from its account's
//! history, scored by an anomaly model and a rule set, and the two signals
//! are fused into a 0-100 risk score with a verdict and an explanation
//! trail. High-risk assessments become persisted alerts.

pub mod alerts;
pub mod config;
pub mod core;
pub mod db;
pub mod features;
pub mod fusion;
pub mod rules;
pub mod scoring;

pub use crate::alerts::{Alert, AlertError, AlertManager, AlertOutcome, AlertSink, PersistOutcome};
pub use crate::config::Config;
pub use crate::core::pipeline::{Pipeline, PipelineOutput, run_pipeline};
pub use crate::core::{ExplanationFactor, RiskAssessment, RuleHit, Transaction, Verdict};
pub use crate::db::SharedAlertStore;
pub use crate::rules::{RuleDefinition, RuleSet, RuleSetHandle};
pub use crate::scoring::{AnomalyScore, AnomalyScorer, ScoringUnavailable};
