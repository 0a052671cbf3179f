use std::collections::BTreeMap;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use txguard::config::ScorerKind;
use txguard::scoring::{LogisticScorer, ModelServiceScorer};
use txguard::{
    AlertManager, AnomalyScorer, Config, Pipeline, PipelineOutput, RuleSet, RuleSetHandle,
    SharedAlertStore, Transaction, Verdict, run_pipeline,
};

/// Usage: txguard [transactions.jsonl]
///
/// Reads one JSON transaction per line (stdin when no file is given) and
/// writes one JSON assessment per line to stdout. Logs go to stderr.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("txguard=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("txguard starting...");

    let config_path = std::env::var("TXGUARD_CONFIG").unwrap_or_else(|_| "config.toml".into());
    let config = Config::load(&config_path)?;

    // Open alert store
    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = SharedAlertStore::open(db_path)?;
    tracing::info!("Alert store opened at {}", config.database.path);

    let rules = RuleSetHandle::new(RuleSet::new(config.rules.clone(), 0)?);
    let input = std::env::args().nth(1);

    match config.scorer.kind {
        ScorerKind::Logistic => {
            let scorer = LogisticScorer::new(&config.scorer.logistic);
            run(scorer, rules, store, &config, input).await
        }
        ScorerKind::Service => {
            let timeout = Duration::from_millis(config.scorer.timeout_ms);
            let scorer = ModelServiceScorer::new(&config.scorer.service, timeout)?;
            run(scorer, rules, store, &config, input).await
        }
    }
}

async fn run<S: AnomalyScorer>(
    scorer: S,
    rules: RuleSetHandle,
    store: SharedAlertStore,
    config: &Config,
    input: Option<String>,
) -> Result<(), Box<dyn Error>> {
    tracing::info!(
        scorer = scorer.name(),
        rules = rules.snapshot().enabled_count(),
        "Scorer ready"
    );

    let pipeline = Arc::new(Pipeline::new(scorer, rules, config));
    let alerts = Arc::new(AlertManager::new(store.clone(), config.alerts.clone()));

    // Reader → Pipeline channel
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    // Pipeline → output channel
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();

    let pipeline_config = config.pipeline.clone();
    let runner = tokio::spawn(async move {
        run_pipeline(in_rx, pipeline, alerts, out_tx, &pipeline_config).await;
    });
    let reader = tokio::spawn(read_transactions(input, in_tx));

    let mut verdicts: BTreeMap<Verdict, u64> = BTreeMap::new();
    while let Some(PipelineOutput::Assessed { assessment, alert }) = out_rx.recv().await {
        *verdicts.entry(assessment.verdict).or_default() += 1;
        if let Err(e) = alert {
            tracing::error!(transaction_id = %assessment.transaction_id, "Alert not persisted: {e}");
        }
        println!("{}", serde_json::to_string(&assessment)?);
    }

    reader.await??;
    runner.await?;

    tracing::info!(
        alerts = store.alert_count()?,
        "Finished: {}",
        verdicts
            .iter()
            .map(|(v, n)| format!("{v}={n}"))
            .collect::<Vec<_>>()
            .join(" ")
    );
    Ok(())
}

async fn read_transactions(
    path: Option<String>,
    tx: mpsc::UnboundedSender<Transaction>,
) -> std::io::Result<()> {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &path {
        Some(path) => Box::new(BufReader::new(tokio::fs::File::open(path).await?)),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut lines = reader.lines();
    let mut line_no: u64 = 0;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Transaction>(&line) {
            Ok(transaction) => {
                if tx.send(transaction).is_err() {
                    tracing::info!("Pipeline closed, stopping reader");
                    break;
                }
            }
            Err(e) => tracing::warn!(line = line_no, "Skipping malformed transaction: {e}"),
        }
    }

    tracing::info!(lines = line_no, "Input exhausted");
    Ok(())
}
