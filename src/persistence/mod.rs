//! SQLite persistence for accounts and batch history.
//!
//! Decimals are stored as TEXT to keep them exact, timestamps as RFC 3339
//! strings. Batch reports are written transactionally so the outcome row
//! and its attempt rows never diverge.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::info;

use crate::pool::{Account, AccountState};
use crate::strategy::{BatchReport, LegReport};

/// Database handle. The connection is behind a mutex; all access is brief
/// and synchronous.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open database at {}", path.as_ref().display()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id              TEXT PRIMARY KEY,
                credential_ref  TEXT NOT NULL,
                proxy_ref       TEXT,
                state           TEXT NOT NULL,
                last_used       TEXT,
                eligible_since  TEXT NOT NULL,
                trades          INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS batches (
                task_id     INTEGER PRIMARY KEY,
                market      TEXT NOT NULL,
                outcome     TEXT NOT NULL,
                imbalance   TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS order_attempts (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id     INTEGER NOT NULL,
                account_id  TEXT NOT NULL,
                market      TEXT NOT NULL,
                side        TEXT NOT NULL,
                attempt     INTEGER NOT NULL,
                price       TEXT,
                quantity    TEXT,
                status      TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_attempts_task
                ON order_attempts (task_id);
            "#,
        )
        .context("Failed to initialize database schema")?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Lock poisoning only happens if a holder panicked; the connection
        // itself is still usable.
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Upsert the full account set.
    pub fn save_accounts(&self, accounts: &[Account]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("Failed to begin transaction")?;
        for account in accounts {
            tx.execute(
                r#"
                INSERT INTO accounts
                    (id, credential_ref, proxy_ref, state, last_used, eligible_since, trades)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(id) DO UPDATE SET
                    credential_ref = excluded.credential_ref,
                    proxy_ref      = excluded.proxy_ref,
                    state          = excluded.state,
                    last_used      = excluded.last_used,
                    eligible_since = excluded.eligible_since,
                    trades         = excluded.trades
                "#,
                params![
                    account.id,
                    account.credential_ref,
                    account.proxy_ref,
                    account.state.as_str(),
                    account.last_used.map(|t| t.to_rfc3339()),
                    account.eligible_since.to_rfc3339(),
                    account.trades,
                ],
            )
            .with_context(|| format!("Failed to save account {}", account.id))?;
        }
        tx.commit().context("Failed to commit account snapshot")?;
        Ok(())
    }

    /// Load all stored accounts. State strings that fail to parse fall back
    /// to Available rather than aborting startup.
    pub fn load_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, credential_ref, proxy_ref, state, last_used, eligible_since, trades
                 FROM accounts ORDER BY id",
            )
            .context("Failed to prepare account query")?;

        let rows = stmt
            .query_map([], |row| {
                let state: String = row.get(3)?;
                let last_used: Option<String> = row.get(4)?;
                let eligible_since: String = row.get(5)?;
                Ok(Account {
                    id: row.get(0)?,
                    credential_ref: row.get(1)?,
                    proxy_ref: row.get(2)?,
                    state: AccountState::parse(&state).unwrap_or(AccountState::Available),
                    last_used: last_used.and_then(|t| parse_timestamp(&t)),
                    eligible_since: parse_timestamp(&eligible_since)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC),
                    trades: row.get(6)?,
                })
            })
            .context("Failed to query accounts")?;

        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row.context("Failed to read account row")?);
        }
        info!(count = accounts.len(), "Loaded accounts from database");
        Ok(accounts)
    }

    /// Record one batch report with all its order attempts.
    pub fn record_batch(&self, report: &BatchReport) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT OR REPLACE INTO batches (task_id, market, outcome, imbalance, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                report.task_id,
                report.market,
                report.outcome.as_str(),
                report.imbalance().to_string(),
                now,
            ],
        )
        .with_context(|| format!("Failed to record batch {}", report.task_id))?;

        for leg in &report.legs {
            self.insert_attempts(&tx, report, leg, &now)?;
        }

        tx.commit().context("Failed to commit batch report")?;
        Ok(())
    }

    fn insert_attempts(
        &self,
        tx: &rusqlite::Transaction<'_>,
        report: &BatchReport,
        leg: &LegReport,
        now: &str,
    ) -> Result<()> {
        for attempt in &leg.result.attempts {
            tx.execute(
                r#"
                INSERT INTO order_attempts
                    (task_id, account_id, market, side, attempt, price, quantity, status, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    report.task_id,
                    leg.account_id,
                    report.market,
                    leg.side.to_string(),
                    attempt.attempt,
                    attempt.price.map(|p| p.to_string()),
                    attempt.quantity.map(|q| q.to_string()),
                    attempt.status.as_str(),
                    now,
                ],
            )
            .with_context(|| format!("Failed to record attempt for {}", leg.account_id))?;
        }
        Ok(())
    }

    /// Batch counts per outcome, for the status report.
    pub fn batch_counts(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT outcome, COUNT(*) FROM batches GROUP BY outcome ORDER BY outcome")
            .context("Failed to prepare outcome query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("Failed to query batch outcomes")?;

        let mut counts = Vec::new();
        for row in rows {
            counts.push(row.context("Failed to read outcome row")?);
        }
        Ok(counts)
    }

    /// Total absolute residual imbalance across batches still holding
    /// exposure.
    pub fn total_residual(&self) -> Result<Decimal> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT imbalance FROM batches WHERE outcome = 'exposure_held'")
            .context("Failed to prepare residual query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query residuals")?;

        let mut total = Decimal::ZERO;
        for row in rows {
            let raw = row.context("Failed to read residual row")?;
            total += Decimal::from_str(&raw).unwrap_or_default().abs();
        }
        Ok(total)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
