use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS alerts (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id TEXT NOT NULL UNIQUE,
            account_id     TEXT NOT NULL,
            verdict        TEXT NOT NULL,
            risk_score     REAL NOT NULL,
            degraded       INTEGER NOT NULL DEFAULT 0,
            explanation    TEXT NOT NULL, -- JSON
            status         TEXT NOT NULL DEFAULT 'open',
            resolution     TEXT,
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS alert_rules (
            alert_id INTEGER NOT NULL REFERENCES alerts(id),
            rule_id  TEXT NOT NULL,
            severity REAL NOT NULL,
            PRIMARY KEY (alert_id, rule_id)
        );

        CREATE INDEX IF NOT EXISTS idx_alerts_status ON alerts(status);
        CREATE INDEX IF NOT EXISTS idx_alerts_score ON alerts(risk_score DESC);
        CREATE INDEX IF NOT EXISTS idx_alerts_account ON alerts(account_id);
        CREATE INDEX IF NOT EXISTS idx_alert_rules_rule ON alert_rules(rule_id);
        ",
    )?;
    Ok(())
}
