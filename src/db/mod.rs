use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::models::{MultiLegBet, SettleResult, SignalStatus, ValueSignal};

/// Snapshot keys.
pub const BANKROLL_SNAPSHOT: &str = "bankroll";
pub const SCORING_SNAPSHOT: &str = "dixon_coles";
pub const RATINGS_SNAPSHOT: &str = "elo";

/// Thread-safe SQLite sink (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("Failed to open database {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Create tables (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Signals ───────────────────────────────────────────────────────────────

    /// Insert a signal or refresh its prices. A settled status and the
    /// recorded flag are never downgraded by a re-scan.
    pub fn upsert_signal(&self, signal: &ValueSignal, recorded: bool) -> Result<()> {
        let payload = serde_json::to_string(signal)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO signals (id, fixture_id, market, outcome, price, edge, stake,
                                  status, recorded, commence_time, created_at, payload)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
             ON CONFLICT(id) DO UPDATE SET
                price=excluded.price,
                edge=excluded.edge,
                stake=CASE WHEN signals.recorded=1 THEN signals.stake ELSE excluded.stake END,
                payload=CASE WHEN signals.recorded=1 THEN signals.payload ELSE excluded.payload END,
                recorded=MAX(signals.recorded, excluded.recorded)
             WHERE signals.status='pending'",
            params![
                signal.id,
                signal.fixture.id,
                signal.market.as_str(),
                signal.outcome.as_str(),
                signal.price,
                signal.edge,
                signal.stake,
                signal.status.as_str(),
                recorded,
                signal.fixture.commence_time,
                signal.created_at,
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn get_signal(&self, id: &str) -> Result<Option<ValueSignal>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row("SELECT payload, status FROM signals WHERE id=?1", params![id], map_payload)
            .optional()?;
        row.map(decode_signal).transpose()
    }

    /// Most recent signals, optionally filtered by status.
    pub fn list_signals(&self, status: Option<SignalStatus>, limit: i64) -> Result<Vec<ValueSignal>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT payload, status FROM signals
             WHERE ?1 IS NULL OR status=?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str()), limit], map_payload)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(decode_signal).collect()
    }

    /// Move a pending signal to a final status. Returns false when the id is
    /// unknown or already final.
    pub fn update_signal_status(&self, id: &str, status: SignalStatus) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE signals SET status=?1 WHERE id=?2 AND status='pending'",
            params![status.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    /// Expire pending signals that were never bet and whose fixture started.
    pub fn expire_started(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE signals SET status='expired'
             WHERE status='pending' AND recorded=0 AND commence_time <= ?1",
            params![now],
        )?;
        Ok(changed)
    }

    // ── Multi-leg bets ────────────────────────────────────────────────────────

    pub fn insert_multi_leg(&self, bet: &MultiLegBet, recorded: bool) -> Result<()> {
        let payload = serde_json::to_string(bet)?;
        let kind = serde_json::to_string(&bet.kind)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO multi_leg_bets (id, kind, legs, total_price, stake,
                                                   status, recorded, created_at, payload)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                bet.id,
                kind,
                bet.legs.len() as i64,
                bet.total_price(),
                bet.stake,
                bet.status.as_str(),
                recorded,
                bet.created_at,
                payload,
            ],
        )?;
        Ok(())
    }

    /// Recorded multi-leg bets still waiting for a result.
    pub fn list_open_multi_legs(&self) -> Result<Vec<MultiLegBet>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT payload, status FROM multi_leg_bets
             WHERE status='pending' AND recorded=1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map([], map_payload)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(payload, _)| serde_json::from_str(&payload).context("Corrupt multi-leg payload"))
            .collect()
    }

    pub fn update_multi_leg_status(&self, id: &str, status: SignalStatus) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE multi_leg_bets SET status=?1 WHERE id=?2 AND status='pending'",
            params![status.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    // ── Settlements ───────────────────────────────────────────────────────────

    pub fn record_settlement(&self, bet_id: &str, result: SettleResult, profit: f64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settlements (bet_id, result, profit, settled_at) VALUES (?1,?2,?3,?4)",
            params![bet_id, SignalStatus::from(result).as_str(), profit, Utc::now()],
        )?;
        Ok(())
    }

    pub fn list_settlements(&self, limit: i64) -> Result<Vec<Settlement>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT bet_id, result, profit, settled_at FROM settlements
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(Settlement {
                    bet_id: row.get(0)?,
                    result: row.get(1)?,
                    profit: row.get(2)?,
                    settled_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    /// Store any serializable state under a key, replacing the previous one.
    pub fn save_snapshot<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO snapshots (key, payload, saved_at) VALUES (?1,?2,?3)
             ON CONFLICT(key) DO UPDATE SET payload=excluded.payload, saved_at=excluded.saved_at",
            params![key, payload, Utc::now()],
        )?;
        Ok(())
    }

    pub fn load_snapshot<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.conn.lock().unwrap();
        let payload: Option<String> = conn
            .query_row("SELECT payload FROM snapshots WHERE key=?1", params![key], |r| r.get(0))
            .optional()?;
        payload
            .map(|p| serde_json::from_str(&p).with_context(|| format!("Corrupt snapshot '{}'", key)))
            .transpose()
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn map_payload(row: &rusqlite::Row) -> rusqlite::Result<(String, String)> {
    Ok((row.get(0)?, row.get(1)?))
}

fn status_from_str(s: &str) -> SignalStatus {
    match s {
        "won" => SignalStatus::Won,
        "lost" => SignalStatus::Lost,
        "void" => SignalStatus::Void,
        "expired" => SignalStatus::Expired,
        _ => SignalStatus::Pending,
    }
}

/// The status column is authoritative over the stored payload.
fn decode_signal((payload, status): (String, String)) -> Result<ValueSignal> {
    let mut signal: ValueSignal = serde_json::from_str(&payload).context("Corrupt signal payload")?;
    signal.status = status_from_str(&status);
    Ok(signal)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub bet_id: String,
    pub result: String,
    pub profit: f64,
    pub settled_at: DateTime<Utc>,
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS signals (
    id            TEXT    PRIMARY KEY,
    fixture_id    TEXT    NOT NULL,
    market        TEXT    NOT NULL,
    outcome       TEXT    NOT NULL,
    price         REAL    NOT NULL,
    edge          REAL    NOT NULL,
    stake         REAL    NOT NULL,
    status        TEXT    NOT NULL DEFAULT 'pending',
    recorded      INTEGER NOT NULL DEFAULT 0,
    commence_time TEXT    NOT NULL,
    created_at    TEXT    NOT NULL,
    payload       TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS multi_leg_bets (
    id          TEXT    PRIMARY KEY,
    kind        TEXT    NOT NULL,
    legs        INTEGER NOT NULL,
    total_price REAL    NOT NULL,
    stake       REAL    NOT NULL,
    status      TEXT    NOT NULL DEFAULT 'pending',
    recorded    INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT    NOT NULL,
    payload     TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS settlements (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    bet_id     TEXT    NOT NULL,
    result     TEXT    NOT NULL,
    profit     REAL    NOT NULL,
    settled_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
    key      TEXT PRIMARY KEY,
    payload  TEXT NOT NULL,
    saved_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(status);
CREATE INDEX IF NOT EXISTS idx_signals_fixture ON signals(fixture_id);
CREATE INDEX IF NOT EXISTS idx_settlements_bet ON settlements(bet_id);
"#;
