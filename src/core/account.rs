use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use super::Transaction;

/// The slice of a past transaction kept in the rolling window.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub transaction_id: String,
    pub amount: f64,
    pub timestamp: DateTime<Utc>,
    pub merchant_category: String,
    pub device_id: Option<String>,
    pub geo_location: Option<String>,
}

impl From<&Transaction> for HistoryEntry {
    fn from(tx: &Transaction) -> Self {
        Self {
            transaction_id: tx.id.clone(),
            amount: tx.amount,
            timestamp: tx.timestamp,
            merchant_category: tx.merchant_category.clone(),
            device_id: tx.device_id.clone(),
            geo_location: tx.geo_location.clone(),
        }
    }
}

/// Rolling per-account aggregate. Owned by exactly one shard worker.
#[derive(Debug, Clone)]
pub struct AccountState {
    history: VecDeque<HistoryEntry>,
    history_limit: usize,
    known_devices: HashSet<String>,
    known_geos: HashSet<String>,
    known_categories: HashSet<String>,
    total_recorded: u64,
}

impl Default for AccountState {
    fn default() -> Self {
        Self::new(1)
    }
}

impl AccountState {
    /// `history_limit` is raised to 1 so the newest entry is always kept.
    pub fn new(history_limit: usize) -> Self {
        Self {
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            known_devices: HashSet::new(),
            known_geos: HashSet::new(),
            known_categories: HashSet::new(),
            total_recorded: 0,
        }
    }

    /// Build a state by recording `txs` in order.
    pub fn with_history<'a>(
        history_limit: usize,
        txs: impl IntoIterator<Item = &'a Transaction>,
    ) -> Self {
        let mut state = Self::new(history_limit);
        for tx in txs {
            state.record(tx);
        }
        state
    }

    /// Append a scored transaction. Must only be called after the
    /// transaction's own evaluation has finished.
    pub fn record(&mut self, tx: &Transaction) {
        if let Some(device) = &tx.device_id {
            self.known_devices.insert(device.clone());
        }
        if let Some(geo) = &tx.geo_location {
            self.known_geos.insert(geo.clone());
        }
        self.known_categories.insert(tx.merchant_category.clone());

        self.history.push_back(HistoryEntry::from(tx));
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        self.total_recorded += 1;
    }

    pub fn history(&self) -> impl ExactSizeIterator<Item = &HistoryEntry> + DoubleEndedIterator {
        self.history.iter()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.history.back()
    }

    pub fn total_recorded(&self) -> u64 {
        self.total_recorded
    }

    pub fn knows_device(&self, device: &str) -> bool {
        self.known_devices.contains(device)
    }

    pub fn knows_geo(&self, geo: &str) -> bool {
        self.known_geos.contains(geo)
    }

    pub fn knows_category(&self, category: &str) -> bool {
        self.known_categories.contains(category)
    }

    /// Count history entries with timestamp in `[at - window, at]`.
    pub fn count_within(&self, at: DateTime<Utc>, window: chrono::Duration) -> usize {
        let from = at - window;
        self.history
            .iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= at)
            .count()
    }

    /// Population mean and standard deviation of the windowed amounts.
    pub fn amount_stats(&self) -> Option<(f64, f64)> {
        if self.history.is_empty() {
            return None;
        }
        let n = self.history.len() as f64;
        let mean = self.history.iter().map(|e| e.amount).sum::<f64>() / n;
        let variance = self
            .history
            .iter()
            .map(|e| (e.amount - mean).powi(2))
            .sum::<f64>()
            / n;
        Some((mean, variance.sqrt()))
    }
}

/// Account states for the accounts routed to one worker.
#[derive(Debug)]
pub struct AccountStore {
    accounts: HashMap<String, AccountState>,
    history_limit: usize,
}

impl AccountStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            accounts: HashMap::new(),
            history_limit,
        }
    }

    pub fn entry(&mut self, account_id: &str) -> &mut AccountState {
        let limit = self.history_limit;
        self.accounts
            .entry(account_id.to_string())
            .or_insert_with(|| AccountState::new(limit))
    }

    pub fn get(&self, account_id: &str) -> Option<&AccountState> {
        self.accounts.get(account_id)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn make_tx(id: &str, amount: f64, minute: i64) -> Transaction {
        Transaction {
            id: id.to_string(),
            account_id: "acct-1".to_string(),
            amount,
            currency: "USD".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
                + chrono::Duration::minutes(minute),
            merchant_category: "grocery".to_string(),
            device_id: Some("dev-1".to_string()),
            geo_location: Some("US".to_string()),
        }
    }

    #[test]
    fn record_updates_known_sets() {
        let mut state = AccountState::new(10);
        assert!(!state.knows_device("dev-1"));
        state.record(&make_tx("t1", 10.0, 0));
        assert!(state.knows_device("dev-1"));
        assert!(state.knows_geo("US"));
        assert!(state.knows_category("grocery"));
        assert_eq!(state.total_recorded(), 1);
    }

    #[test]
    fn history_window_is_bounded() {
        let txs: Vec<_> = (0..5).map(|i| make_tx(&format!("t{i}"), i as f64, i)).collect();
        let state = AccountState::with_history(3, &txs);
        assert_eq!(state.history().len(), 3);
        assert_eq!(state.history().next().unwrap().transaction_id, "t2");
        assert_eq!(state.total_recorded(), 5);
    }

    #[test]
    fn default_state_keeps_newest_entry() {
        let txs = [make_tx("t0", 1.0, 0), make_tx("t1", 2.0, 1)];
        let mut state = AccountState::default();
        for tx in &txs {
            state.record(tx);
        }
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.history().next().unwrap().transaction_id, "t1");
        assert_eq!(state.total_recorded(), 2);
        assert_eq!(AccountState::with_history(0, &txs).history().len(), 1);
    }

    #[test]
    fn amount_stats_population() {
        let txs = vec![make_tx("a", 80.0, 0), make_tx("b", 120.0, 1)];
        let state = AccountState::with_history(10, &txs);
        let (mean, sd) = state.amount_stats().unwrap();
        assert!((mean - 100.0).abs() < 1e-9);
        assert!((sd - 20.0).abs() < 1e-9);
    }

    #[test]
    fn amount_stats_empty() {
        assert!(AccountState::new(10).amount_stats().is_none());
    }

    #[test]
    fn count_within_window_inclusive() {
        let txs = vec![make_tx("a", 1.0, 0), make_tx("b", 1.0, 5), make_tx("c", 1.0, 9)];
        let state = AccountState::with_history(10, &txs);
        let at = make_tx("x", 1.0, 10).timestamp;
        assert_eq!(state.count_within(at, chrono::Duration::minutes(10)), 3);
        assert_eq!(state.count_within(at, chrono::Duration::minutes(5)), 2);
    }

    #[test]
    fn store_creates_on_demand() {
        let mut store = AccountStore::new(5);
        assert!(store.is_empty());
        store.entry("a").record(&make_tx("t1", 1.0, 0));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap().total_recorded(), 1);
        assert!(store.get("b").is_none());
    }
}
