//! Persistence (C8): a single SQLite file behind one writer connection.
//!
//! Directly modeled on `vault/vault_db.rs::VaultDb` — WAL journal mode,
//! `CREATE TABLE IF NOT EXISTS` at construction (forward-only migration, no
//! down-migrations), `prepare_cached` statements, timestamps stored as
//! Unix-epoch seconds and converted at the boundary.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::models::{
    BrokerMode, CrisisType, DefconLevel, DefconState, ExitReason, MarketSnapshot, NewsSignal,
    PendingDecision, Position, PositionStatus, RunMode, SentimentDist,
};

fn to_epoch(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening database at {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                qty REAL NOT NULL,
                entry_price REAL NOT NULL,
                entry_time INTEGER NOT NULL,
                entry_defcon INTEGER NOT NULL,
                peak_price REAL NOT NULL,
                current_price REAL NOT NULL,
                status TEXT NOT NULL,
                exit_price REAL,
                exit_time INTEGER,
                exit_reason TEXT
            );

            CREATE TABLE IF NOT EXISTS news_signals (
                cycle_id INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                article_count INTEGER NOT NULL,
                score REAL NOT NULL,
                crisis_type TEXT NOT NULL,
                sentiment_dist TEXT NOT NULL,
                top_articles TEXT NOT NULL,
                breaking_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS market_snapshots (
                timestamp INTEGER PRIMARY KEY,
                vix REAL NOT NULL,
                bond_yield_10y REAL NOT NULL,
                sp500_change_pct REAL NOT NULL,
                per_symbol_price TEXT NOT NULL,
                stale INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS defcon_state (
                entered_at INTEGER PRIMARY KEY,
                level INTEGER NOT NULL,
                signal_score REAL NOT NULL,
                reason_code TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending_decisions (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                subject TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                status TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS orchestrator_state (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                mode TEXT NOT NULL,
                broker_mode TEXT NOT NULL,
                cycle_interval_sec INTEGER NOT NULL,
                last_cycle_start INTEGER,
                cycle_count INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub async fn save_position(&self, position: &Position) -> Result<()> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "INSERT INTO positions
                (id, symbol, qty, entry_price, entry_time, entry_defcon, peak_price,
                 current_price, status, exit_price, exit_time, exit_reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                qty = excluded.qty,
                peak_price = excluded.peak_price,
                current_price = excluded.current_price,
                status = excluded.status,
                exit_price = excluded.exit_price,
                exit_time = excluded.exit_time,
                exit_reason = excluded.exit_reason",
        )?;
        stmt.execute(params![
            position.id,
            position.symbol,
            position.qty,
            position.entry_price,
            to_epoch(position.entry_time),
            position.entry_defcon,
            position.peak_price,
            position.current_price,
            status_str(position.status),
            position.exit_price,
            position.exit_time.map(to_epoch),
            position.exit_reason.map(|r| r.as_str()),
        ])?;
        Ok(())
    }

    pub async fn load_positions(&self) -> Result<Vec<Position>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, qty, entry_price, entry_time, entry_defcon, peak_price,
                    current_price, status, exit_price, exit_time, exit_reason
             FROM positions",
        )?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(8)?;
            let exit_reason: Option<String> = row.get(11)?;
            Ok(Position {
                id: row.get(0)?,
                symbol: row.get(1)?,
                qty: row.get(2)?,
                entry_price: row.get(3)?,
                entry_time: from_epoch(row.get(4)?),
                entry_defcon: row.get(5)?,
                peak_price: row.get(6)?,
                current_price: row.get(7)?,
                status: status_from_str(&status),
                exit_price: row.get(9)?,
                exit_time: row.get::<_, Option<i64>>(10)?.map(from_epoch),
                exit_reason: exit_reason.as_deref().map(exit_reason_from_str),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("loading positions")
    }

    pub async fn save_news_signal(&self, signal: &NewsSignal) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.prepare_cached(
            "INSERT OR REPLACE INTO news_signals
                (cycle_id, timestamp, article_count, score, crisis_type, sentiment_dist,
                 top_articles, breaking_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?
        .execute(params![
            signal.cycle_id,
            to_epoch(signal.timestamp),
            signal.article_count,
            signal.score,
            signal.crisis_type.as_str(),
            serde_json::to_string(&signal.sentiment_dist)?,
            serde_json::to_string(&signal.top_articles)?,
            signal.breaking_count,
        ])?;
        Ok(())
    }

    pub async fn load_last_news_signal(&self) -> Result<Option<NewsSignal>> {
        let conn = self.conn.lock().await;
        let result = conn
            .query_row(
                "SELECT cycle_id, timestamp, article_count, score, crisis_type,
                        sentiment_dist, top_articles, breaking_count
                 FROM news_signals ORDER BY cycle_id DESC LIMIT 1",
                [],
                |row| {
                    let sentiment_raw: String = row.get(5)?;
                    let top_raw: String = row.get(6)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                        sentiment_raw,
                        top_raw,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()
            .context("loading last news signal")?;

        Ok(result.map(
            |(cycle_id, ts, count, score, crisis, sentiment_raw, top_raw, breaking)| NewsSignal {
                cycle_id,
                timestamp: from_epoch(ts),
                article_count: count as usize,
                score,
                crisis_type: CrisisType::from_str_loose(&crisis),
                sentiment_dist: serde_json::from_str::<SentimentDist>(&sentiment_raw)
                    .unwrap_or_default(),
                top_articles: serde_json::from_str(&top_raw).unwrap_or_default(),
                breaking_count: breaking as usize,
            },
        ))
    }

    pub async fn save_market_snapshot(&self, snapshot: &MarketSnapshot) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.prepare_cached(
            "INSERT OR REPLACE INTO market_snapshots
                (timestamp, vix, bond_yield_10y, sp500_change_pct, per_symbol_price, stale)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?
        .execute(params![
            to_epoch(snapshot.timestamp),
            snapshot.vix,
            snapshot.bond_yield_10y,
            snapshot.sp500_change_pct,
            serde_json::to_string(&snapshot.per_symbol_price)?,
            snapshot.stale,
        ])?;
        Ok(())
    }

    /// Append a new DEFCON state row. Entries are never mutated — the table
    /// is an audit log of every level change.
    pub async fn append_defcon_state(&self, state: &DefconState) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.prepare_cached(
            "INSERT INTO defcon_state (entered_at, level, signal_score, reason_code)
             VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![
            to_epoch(state.entered_at),
            state.level.0,
            state.signal_score,
            state.reason_code,
        ])?;
        Ok(())
    }

    pub async fn load_latest_defcon_state(&self) -> Result<Option<DefconState>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT entered_at, level, signal_score, reason_code
             FROM defcon_state ORDER BY entered_at DESC LIMIT 1",
            [],
            |row| {
                Ok(DefconState {
                    level: DefconLevel(row.get(1)?),
                    signal_score: row.get(2)?,
                    entered_at: from_epoch(row.get::<_, i64>(0)?),
                    reason_code: row.get(3)?,
                })
            },
        )
        .optional()
        .context("loading latest defcon state")
    }

    pub async fn save_pending_decision(&self, decision: &PendingDecision) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.prepare_cached(
            "INSERT INTO pending_decisions (id, kind, subject, created_at, expires_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status",
        )?
        .execute(params![
            decision.id,
            kind_str(decision.kind),
            decision.subject,
            to_epoch(decision.created_at),
            to_epoch(decision.expires_at),
            decision_status_str(decision.status),
        ])?;
        Ok(())
    }

    pub async fn load_awaiting_decisions(&self) -> Result<Vec<PendingDecision>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, kind, subject, created_at, expires_at, status
             FROM pending_decisions WHERE status = 'awaiting'",
        )?;
        let rows = stmt.query_map([], |row| {
            let kind: String = row.get(1)?;
            let status: String = row.get(5)?;
            Ok(PendingDecision {
                id: row.get(0)?,
                kind: kind_from_str(&kind),
                subject: row.get(2)?,
                created_at: from_epoch(row.get(3)?),
                expires_at: from_epoch(row.get(4)?),
                status: decision_status_from_str(&status),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("loading awaiting decisions")
    }

    pub async fn save_orchestrator_state(
        &self,
        state: &crate::models::OrchestratorState,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.prepare_cached(
            "INSERT INTO orchestrator_state
                (id, mode, broker_mode, cycle_interval_sec, last_cycle_start, cycle_count)
             VALUES (0, ?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                mode = excluded.mode,
                broker_mode = excluded.broker_mode,
                cycle_interval_sec = excluded.cycle_interval_sec,
                last_cycle_start = excluded.last_cycle_start,
                cycle_count = excluded.cycle_count",
        )?
        .execute(params![
            run_mode_str(state.mode),
            broker_mode_str(state.broker_mode),
            state.cycle_interval_sec,
            state.last_cycle_start.map(to_epoch),
            state.cycle_count,
        ])?;
        Ok(())
    }

    pub async fn load_orchestrator_state(
        &self,
    ) -> Result<Option<crate::models::OrchestratorState>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT mode, broker_mode, cycle_interval_sec, last_cycle_start, cycle_count
             FROM orchestrator_state WHERE id = 0",
            [],
            |row| {
                let mode: String = row.get(0)?;
                let broker: String = row.get(1)?;
                Ok(crate::models::OrchestratorState {
                    mode: run_mode_from_str(&mode),
                    broker_mode: broker_mode_from_str(&broker),
                    cycle_interval_sec: row.get(2)?,
                    last_cycle_start: row.get::<_, Option<i64>>(3)?.map(from_epoch),
                    cycle_count: row.get(4)?,
                })
            },
        )
        .optional()
        .context("loading orchestrator state")
    }
}

fn status_str(status: PositionStatus) -> &'static str {
    match status {
        PositionStatus::Open => "open",
        PositionStatus::PendingExit => "pending_exit",
        PositionStatus::Closed => "closed",
    }
}

fn status_from_str(s: &str) -> PositionStatus {
    match s {
        "pending_exit" => PositionStatus::PendingExit,
        "closed" => PositionStatus::Closed,
        _ => PositionStatus::Open,
    }
}

fn exit_reason_from_str(s: &str) -> ExitReason {
    match s {
        "profit_target" => ExitReason::ProfitTarget,
        "trailing_stop" => ExitReason::TrailingStop,
        "defcon_revert" => ExitReason::DefconRevert,
        "time_limit" => ExitReason::TimeLimit,
        _ => ExitReason::StopLoss,
    }
}

fn kind_str(kind: crate::models::DecisionKind) -> &'static str {
    match kind {
        crate::models::DecisionKind::Entry => "entry",
        crate::models::DecisionKind::Exit => "exit",
    }
}

fn kind_from_str(s: &str) -> crate::models::DecisionKind {
    match s {
        "exit" => crate::models::DecisionKind::Exit,
        _ => crate::models::DecisionKind::Entry,
    }
}

fn decision_status_str(status: crate::models::DecisionStatus) -> &'static str {
    use crate::models::DecisionStatus::*;
    match status {
        Awaiting => "awaiting",
        Approved => "approved",
        Rejected => "rejected",
        Expired => "expired",
    }
}

fn decision_status_from_str(s: &str) -> crate::models::DecisionStatus {
    use crate::models::DecisionStatus::*;
    match s {
        "approved" => Approved,
        "rejected" => Rejected,
        "expired" => Expired,
        _ => Awaiting,
    }
}

fn run_mode_str(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Running => "running",
        RunMode::Held => "held",
        RunMode::EStopped => "e_stopped",
        RunMode::ShuttingDown => "shutting_down",
    }
}

fn run_mode_from_str(s: &str) -> RunMode {
    match s {
        "held" => RunMode::Held,
        "e_stopped" => RunMode::EStopped,
        "shutting_down" => RunMode::ShuttingDown,
        _ => RunMode::Running,
    }
}

fn broker_mode_str(mode: BrokerMode) -> &'static str {
    match mode {
        BrokerMode::Disabled => "disabled",
        BrokerMode::SemiAuto => "semi_auto",
        BrokerMode::FullAuto => "full_auto",
    }
}

fn broker_mode_from_str(s: &str) -> BrokerMode {
    BrokerMode::from_str_loose(s).unwrap_or(BrokerMode::Disabled)
}
