//! SQLite persistence for keeper state.
//!
//! Holds what must survive restarts:
//! - Per-project tunable parameters (authoritative copy behind the cache)
//! - Journal of every corrective order leg
//! - Periodic equity snapshots from the report cycle

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::config::TunableParams;
use crate::exchange::OrderSide;

/// One journaled order leg.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    /// "rebalance", "decrease" or "settle"
    pub phase: String,
    pub token: String,
    pub venue: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub order_id: Option<String>,
    /// "filled", "rejected", "timeout", ...
    pub status: String,
}

/// Equity snapshot written by the report cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct EquitySnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_equity: Decimal,
    pub gross_notional: Decimal,
    pub token_count: u32,
}

/// SQLite-based persistence manager.
pub struct PersistenceManager {
    conn: Mutex<Connection>,
}

impl PersistenceManager {
    /// Open (or create) the database and initialize the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        let manager = Self {
            conn: Mutex::new(conn),
        };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", path);
        Ok(manager)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        let manager = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        manager.init_schema()?;
        Ok(manager)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("database connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            -- Tunable parameters per project (JSON blob)
            CREATE TABLE IF NOT EXISTS project_config (
                project TEXT PRIMARY KEY,
                params TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Corrective order legs
            CREATE TABLE IF NOT EXISTS order_journal (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                phase TEXT NOT NULL,
                token TEXT NOT NULL,
                venue TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                order_id TEXT,
                status TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_journal_timestamp ON order_journal(timestamp);
            CREATE INDEX IF NOT EXISTS idx_journal_token ON order_journal(token);

            -- Equity snapshots (report cycle)
            CREATE TABLE IF NOT EXISTS equity_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                total_equity TEXT NOT NULL,
                gross_notional TEXT NOT NULL,
                token_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_timestamp ON equity_snapshots(timestamp);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Stored tunables for a project, if any.
    pub fn load_tunables(&self, project: &str) -> Result<Option<TunableParams>> {
        let raw: Option<String> = self
            .conn()?
            .query_row(
                "SELECT params FROM project_config WHERE project = ?1",
                params![project],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|raw| {
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid tunables stored for project {}", project))
        })
        .transpose()
    }

    /// Replace a project's tunables.
    pub fn save_tunables(&self, project: &str, tunables: &TunableParams) -> Result<()> {
        let blob = serde_json::to_string(tunables)?;
        self.conn()?.execute(
            r#"
            INSERT INTO project_config (project, params, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(project) DO UPDATE SET
                params = ?2,
                updated_at = ?3
            "#,
            params![project, blob, Utc::now().to_rfc3339()],
        )?;
        debug!(%project, "Tunables saved");
        Ok(())
    }

    /// Append order legs to the journal in one transaction.
    pub fn record_orders(&self, entries: &[JournalEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        for entry in entries {
            tx.execute(
                r#"
                INSERT INTO order_journal (timestamp, phase, token, venue, symbol, side,
                                           quantity, order_id, status)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    entry.timestamp.to_rfc3339(),
                    entry.phase,
                    entry.token,
                    entry.venue,
                    entry.symbol,
                    entry.side.to_string(),
                    entry.quantity.to_string(),
                    entry.order_id,
                    entry.status,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Most recent journal entries, newest first.
    pub fn recent_orders(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT timestamp, phase, token, venue, symbol, side, quantity, order_id, status
            FROM order_journal
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let entries = stmt
            .query_map([limit], |row| {
                let ts: String = row.get(0)?;
                let side: String = row.get(5)?;
                let quantity: String = row.get(6)?;
                Ok(JournalEntry {
                    timestamp: parse_timestamp(&ts),
                    phase: row.get(1)?,
                    token: row.get(2)?,
                    venue: row.get(3)?,
                    symbol: row.get(4)?,
                    side: if side == "BUY" { OrderSide::Buy } else { OrderSide::Sell },
                    quantity: Decimal::from_str(&quantity).unwrap_or_default(),
                    order_id: row.get(7)?,
                    status: row.get(8)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(entries)
    }

    /// Record an equity snapshot.
    pub fn record_snapshot(&self, snapshot: &EquitySnapshot) -> Result<()> {
        self.conn()?.execute(
            r#"
            INSERT INTO equity_snapshots (timestamp, total_equity, gross_notional, token_count)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                snapshot.timestamp.to_rfc3339(),
                snapshot.total_equity.to_string(),
                snapshot.gross_notional.to_string(),
                snapshot.token_count,
            ],
        )?;
        Ok(())
    }

    /// Recent equity snapshots, newest first.
    pub fn recent_snapshots(&self, limit: usize) -> Result<Vec<EquitySnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT timestamp, total_equity, gross_notional, token_count
            FROM equity_snapshots
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let snapshots = stmt
            .query_map([limit], |row| {
                let ts: String = row.get(0)?;
                let equity: String = row.get(1)?;
                let gross: String = row.get(2)?;
                Ok(EquitySnapshot {
                    timestamp: parse_timestamp(&ts),
                    total_equity: Decimal::from_str(&equity).unwrap_or_default(),
                    gross_notional: Decimal::from_str(&gross).unwrap_or_default(),
                    token_count: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(snapshots)
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
