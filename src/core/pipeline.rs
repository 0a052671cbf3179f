use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertError, AlertManager, AlertOutcome, AlertSink};
use crate::config::{Config, FeatureConfig, FusionConfig, PipelineConfig};
use crate::core::account::{AccountState, AccountStore};
use crate::core::{RiskAssessment, Transaction};
use crate::features::{Extraction, HistoryStatus, extract};
use crate::fusion::fuse;
use crate::rules::{self, RuleSetHandle};
use crate::scoring::{AnomalyScorer, ScoringUnavailable};

/// Per-transaction scoring: features, rules and model, fused into one
/// assessment.
pub struct Pipeline<S> {
    features: FeatureConfig,
    fusion: FusionConfig,
    scorer: S,
    rules: RuleSetHandle,
    scorer_timeout: Duration,
}

impl<S: AnomalyScorer> Pipeline<S> {
    pub fn new(scorer: S, rules: RuleSetHandle, config: &Config) -> Self {
        Self {
            features: config.features.clone(),
            fusion: config.fusion.clone(),
            scorer,
            rules,
            scorer_timeout: Duration::from_millis(config.scorer.timeout_ms),
        }
    }

    pub fn rules(&self) -> &RuleSetHandle {
        &self.rules
    }

    /// Score `tx` against the history in `state` without touching it.
    pub async fn evaluate(&self, tx: &Transaction, state: &AccountState) -> RiskAssessment {
        let Extraction { features, history } = extract(tx, state, &self.features);
        if let HistoryStatus::InsufficientHistory { available, required } = history {
            debug!(
                transaction_id = %tx.id,
                account_id = %tx.account_id,
                available,
                required,
                "Insufficient history, using neutral features"
            );
        }

        let rule_set = self.rules.snapshot();
        let hits = rules::evaluate(tx, state, &features, &rule_set);

        let anomaly = match tokio::time::timeout(self.scorer_timeout, self.scorer.score(&features)).await {
            Ok(result) => result,
            Err(_) => Err(ScoringUnavailable::new(format!(
                "{} timed out after {}ms",
                self.scorer.name(),
                self.scorer_timeout.as_millis()
            ))),
        };
        if let Err(e) = &anomaly {
            warn!(transaction_id = %tx.id, reason = %e.reason, "Scoring unavailable, using rules only");
        }

        fuse(tx, &anomaly, hits, &rule_set, &self.fusion)
    }

    /// Evaluate, then append `tx` to the account history.
    pub async fn assess(&self, tx: &Transaction, state: &mut AccountState) -> RiskAssessment {
        let assessment = self.evaluate(tx, state).await;
        state.record(tx);
        assessment
    }
}

/// Messages from pipeline to the consumer.
#[derive(Debug, Clone)]
pub enum PipelineOutput {
    Assessed {
        assessment: RiskAssessment,
        alert: Result<AlertOutcome, AlertError>,
    },
}

/// Run the pipeline: route transactions to shard workers by account, score
/// them, dispatch alerts and forward assessments.
///
/// Each account maps to exactly one shard, so its transactions are scored
/// in arrival order against state no other task touches.
pub async fn run_pipeline<S: AnomalyScorer, A: AlertSink>(
    mut rx: mpsc::UnboundedReceiver<Transaction>,
    pipeline: Arc<Pipeline<S>>,
    alerts: Arc<AlertManager<A>>,
    out: mpsc::UnboundedSender<PipelineOutput>,
    config: &PipelineConfig,
) {
    let shards = config.shards.max(1);
    let history_limit = pipeline.features.history_limit;
    let mut senders = Vec::with_capacity(shards);
    let mut workers = Vec::with_capacity(shards);

    for shard in 0..shards {
        let (shard_tx, shard_rx) = mpsc::channel(config.queue_capacity.max(1));
        senders.push(shard_tx);
        workers.push(tokio::spawn(shard_worker(
            shard,
            shard_rx,
            AccountStore::new(history_limit),
            Arc::clone(&pipeline),
            Arc::clone(&alerts),
            out.clone(),
        )));
    }
    drop(out);

    info!(shards, "Pipeline started, waiting for transactions...");

    while let Some(tx) = rx.recv().await {
        let shard = shard_for(&tx.account_id, shards);
        if senders[shard].send(tx).await.is_err() {
            warn!(shard, "Shard worker stopped, stopping pipeline");
            break;
        }
    }
    drop(senders);

    let mut total: u64 = 0;
    for worker in workers {
        match worker.await {
            Ok(count) => total += count,
            Err(e) => error!("Shard worker failed: {e}"),
        }
    }

    info!("Pipeline shutting down after {total} txs");
}

async fn shard_worker<S: AnomalyScorer, A: AlertSink>(
    shard: usize,
    mut rx: mpsc::Receiver<Transaction>,
    mut accounts: AccountStore,
    pipeline: Arc<Pipeline<S>>,
    alerts: Arc<AlertManager<A>>,
    out: mpsc::UnboundedSender<PipelineOutput>,
) -> u64 {
    let mut tx_count: u64 = 0;

    while let Some(tx) = rx.recv().await {
        let assessment = pipeline.assess(&tx, accounts.entry(&tx.account_id)).await;
        debug!(
            transaction_id = %assessment.transaction_id,
            risk_score = assessment.risk_score,
            verdict = %assessment.verdict,
            degraded = assessment.degraded,
            "Transaction assessed"
        );

        let alert = alerts.dispatch(&assessment).await;
        if let Err(e) = &alert {
            error!(shard, "{e}");
        }

        tx_count += 1;
        if tx_count % 1000 == 0 {
            info!(shard, "Shard processed {tx_count} txs across {} accounts", accounts.len());
        }

        if out.send(PipelineOutput::Assessed { assessment, alert }).is_err() {
            info!(shard, "Output channel closed, stopping shard");
            break;
        }
    }

    tx_count
}

fn shard_for(account_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    account_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}
