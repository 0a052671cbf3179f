pub mod schema;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::alerts::{Alert, AlertSink, PersistOutcome};
use crate::core::{ExplanationFactor, Verdict};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Investigation workflow state of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Investigating,
    Resolved,
    Dismissed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Investigating => "investigating",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AlertStatus::Open),
            "investigating" => Some(AlertStatus::Investigating),
            "resolved" => Some(AlertStatus::Resolved),
            "dismissed" => Some(AlertStatus::Dismissed),
            _ => None,
        }
    }
}

/// A persisted alert as read back from the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: i64,
    pub transaction_id: String,
    pub account_id: String,
    pub verdict: Verdict,
    pub risk_score: f64,
    pub degraded: bool,
    pub explanation: Vec<ExplanationFactor>,
    pub status: AlertStatus,
    pub resolution: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct Database {
    conn: Connection,
}

/// Thread-safe wrapper around Database.
#[derive(Clone)]
pub struct SharedAlertStore {
    inner: Arc<Mutex<Database>>,
}

const ALERT_COLUMNS: &str = "id, transaction_id, account_id, verdict, risk_score, degraded, explanation, status, resolution, created_at, updated_at";

impl SharedAlertStore {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an alert unless one exists for the same transaction.
    pub fn insert_alert(&self, alert: &Alert) -> Result<PersistOutcome, StoreError> {
        self.lock().insert_alert(alert)
    }

    pub fn get_alert(&self, id: i64) -> Result<Option<AlertRecord>, rusqlite::Error> {
        self.lock().get_alert(id)
    }

    pub fn get_alert_by_transaction(&self, transaction_id: &str) -> Result<Option<AlertRecord>, rusqlite::Error> {
        self.lock().get_alert_by_transaction(transaction_id)
    }

    /// Alerts in the given status, newest first.
    pub fn get_alerts_by_status(&self, status: AlertStatus, limit: usize) -> Result<Vec<AlertRecord>, rusqlite::Error> {
        self.lock().get_alerts_by_status(status, limit)
    }

    /// Get alerts with risk score at or above threshold.
    pub fn get_alerts_above_score(&self, min_score: f64, limit: usize) -> Result<Vec<AlertRecord>, rusqlite::Error> {
        self.lock().get_alerts_above_score(min_score, limit)
    }

    /// Move an alert through the investigation workflow. A `None` resolution
    /// keeps the existing note. Returns false if the alert does not exist.
    pub fn update_alert_status(
        &self,
        id: i64,
        status: AlertStatus,
        resolution: Option<&str>,
    ) -> Result<bool, rusqlite::Error> {
        self.lock().update_alert_status(id, status, resolution)
    }

    pub fn alert_rules(&self, alert_id: i64) -> Result<Vec<(String, f64)>, rusqlite::Error> {
        self.lock().alert_rules(alert_id)
    }

    /// Number of alerts each rule contributed to, most frequent first.
    pub fn rule_alert_counts(&self) -> Result<Vec<(String, usize)>, rusqlite::Error> {
        self.lock().rule_alert_counts()
    }

    pub fn alert_count(&self) -> Result<usize, rusqlite::Error> {
        self.lock().alert_count()
    }
}

impl AlertSink for SharedAlertStore {
    type Error = StoreError;

    async fn persist(&self, alert: &Alert) -> Result<PersistOutcome, StoreError> {
        let store = self.clone();
        let alert = alert.clone();
        tokio::task::spawn_blocking(move || store.insert_alert(&alert)).await?
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    pub fn insert_alert(&self, alert: &Alert) -> Result<PersistOutcome, StoreError> {
        let explanation = serde_json::to_string(&alert.explanation)?;
        let created_at = alert.created_at.format("%Y-%m-%d %H:%M:%S").to_string();

        let tx = self.conn.unchecked_transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO alerts (transaction_id, account_id, verdict, risk_score, degraded, explanation, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7, ?7)",
            rusqlite::params![
                alert.transaction_id,
                alert.account_id,
                alert.verdict.as_str(),
                alert.risk_score,
                alert.degraded as i32,
                explanation,
                created_at
            ],
        )?;
        let id: i64 = tx.query_row(
            "SELECT id FROM alerts WHERE transaction_id = ?1",
            rusqlite::params![alert.transaction_id],
            |row| row.get(0),
        )?;
        if inserted == 0 {
            return Ok(PersistOutcome::AlreadyExists(id));
        }
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO alert_rules (alert_id, rule_id, severity) VALUES (?1, ?2, ?3)",
            )?;
            for (rule_id, severity) in alert.rule_severities() {
                stmt.execute(rusqlite::params![id, rule_id, severity])?;
            }
        }
        tx.commit()?;
        Ok(PersistOutcome::Created(id))
    }

    fn row_to_alert(row: &rusqlite::Row) -> rusqlite::Result<AlertRecord> {
        let verdict: String = row.get(3)?;
        let explanation: String = row.get(6)?;
        let status: String = row.get(7)?;
        Ok(AlertRecord {
            id: row.get(0)?,
            transaction_id: row.get(1)?,
            account_id: row.get(2)?,
            verdict: Verdict::parse(&verdict).ok_or_else(|| bad_column(3, &verdict))?,
            risk_score: row.get(4)?,
            degraded: row.get::<_, i32>(5)? != 0,
            explanation: serde_json::from_str(&explanation).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
            })?,
            status: AlertStatus::parse(&status).ok_or_else(|| bad_column(7, &status))?,
            resolution: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    pub fn get_alert(&self, id: i64) -> Result<Option<AlertRecord>, rusqlite::Error> {
        self.conn
            .query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
                rusqlite::params![id],
                Self::row_to_alert,
            )
            .optional()
    }

    pub fn get_alert_by_transaction(&self, transaction_id: &str) -> Result<Option<AlertRecord>, rusqlite::Error> {
        self.conn
            .query_row(
                &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE transaction_id = ?1"),
                rusqlite::params![transaction_id],
                Self::row_to_alert,
            )
            .optional()
    }

    pub fn get_alerts_by_status(&self, status: AlertStatus, limit: usize) -> Result<Vec<AlertRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE status = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![status.as_str(), limit as i64], Self::row_to_alert)?;
        rows.collect()
    }

    pub fn get_alerts_above_score(&self, min_score: f64, limit: usize) -> Result<Vec<AlertRecord>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE risk_score >= ?1 ORDER BY risk_score DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![min_score, limit as i64], Self::row_to_alert)?;
        rows.collect()
    }

    pub fn update_alert_status(
        &self,
        id: i64,
        status: AlertStatus,
        resolution: Option<&str>,
    ) -> Result<bool, rusqlite::Error> {
        let changed = self.conn.execute(
            "UPDATE alerts SET status = ?1, resolution = COALESCE(?2, resolution), updated_at = datetime('now')
             WHERE id = ?3",
            rusqlite::params![status.as_str(), resolution, id],
        )?;
        Ok(changed > 0)
    }

    pub fn alert_rules(&self, alert_id: i64) -> Result<Vec<(String, f64)>, rusqlite::Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT rule_id, severity FROM alert_rules WHERE alert_id = ?1 ORDER BY rowid")?;
        let rows = stmt.query_map(rusqlite::params![alert_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    pub fn rule_alert_counts(&self) -> Result<Vec<(String, usize)>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(
            "SELECT rule_id, COUNT(*) AS n FROM alert_rules GROUP BY rule_id ORDER BY n DESC, rule_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        rows.collect()
    }

    pub fn alert_count(&self) -> Result<usize, rusqlite::Error> {
        self.conn.query_row("SELECT COUNT(*) FROM alerts", [], |row| {
            row.get::<_, i64>(0).map(|c| c as usize)
        })
    }
}

fn bad_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unexpected value '{value}'").into(),
    )
}
