//! Paper trade ledger (C7): open/mark/close lifecycle for synthetic
//! positions, broker-mode gated.
//!
//! Grounded on `vault/paper_ledger.rs::VaultPaperLedger::apply_buy` /
//! `apply_sell` — same open/close bookkeeping, generalized from a single
//! buy-then-sell flow to the richer multi-strategy exit lifecycle here.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::exits::refresh_peak;
use crate::models::{BrokerMode, ExitReason, Position, PositionStatus};

/// In-memory paper-trading book. Persistence is the caller's responsibility
/// (the orchestrator round-trips positions through the store after each
/// mutation) — the ledger itself only enforces lifecycle invariants.
#[derive(Debug, Default)]
pub struct Ledger {
    positions: BTreeMap<String, Position>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore positions from persistence at boot.
    pub fn load(positions: Vec<Position>) -> Self {
        let mut ledger = Self::new();
        for position in positions {
            ledger.positions.insert(position.id.clone(), position);
        }
        ledger
    }

    /// Open a new paper position. Disallowed when `broker_mode` is
    /// `Disabled` — monitoring-only deployments never enter trades.
    pub fn open(
        &mut self,
        symbol: impl Into<String>,
        qty: f64,
        entry_price: f64,
        entry_defcon: u8,
        broker_mode: BrokerMode,
        now: DateTime<Utc>,
    ) -> Result<&Position> {
        if broker_mode == BrokerMode::Disabled {
            bail!("broker mode disabled: cannot open new positions");
        }
        if !entry_price.is_finite() || entry_price <= 0.0 {
            bail!("invalid entry price {entry_price}");
        }
        if !qty.is_finite() || qty <= 0.0 {
            bail!("invalid qty {qty}");
        }

        let id = Uuid::new_v4().to_string();
        let position = Position {
            id: id.clone(),
            symbol: symbol.into(),
            qty,
            entry_price,
            entry_time: now,
            entry_defcon,
            peak_price: entry_price,
            current_price: entry_price,
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
        };
        self.positions.insert(id.clone(), position);
        Ok(self.positions.get(&id).unwrap())
    }

    /// Mark a position to the current price, refreshing its peak. A no-op on
    /// a closed position, an unknown id, or a non-finite/non-positive price.
    pub fn mark(&mut self, id: &str, price: f64) {
        if let Some(position) = self.positions.get_mut(id) {
            if position.status != PositionStatus::Closed {
                refresh_peak(position, price);
            }
        }
    }

    /// Close an open position. Errors on an unknown id or a double-close —
    /// closing is a one-way transition.
    pub fn close(
        &mut self,
        id: &str,
        exit_price: f64,
        reason: ExitReason,
        now: DateTime<Utc>,
    ) -> Result<&Position> {
        let position = self
            .positions
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown position {id}"))?;
        if position.status == PositionStatus::Closed {
            bail!("position {id} is already closed");
        }
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.exit_time = Some(now);
        position.exit_reason = Some(reason);
        Ok(position)
    }

    pub fn get(&self, id: &str) -> Option<&Position> {
        self.positions.get(id)
    }

    pub fn list_open(&self) -> Vec<&Position> {
        self.positions
            .values()
            .filter(|p| p.status != PositionStatus::Closed)
            .collect()
    }

    pub fn list_all(&self) -> Vec<&Position> {
        self.positions.values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_rejected_when_broker_mode_disabled() {
        let mut ledger = Ledger::new();
        let err = ledger
            .open("SPY", 10.0, 100.0, 5, BrokerMode::Disabled, Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn open_rejects_nonpositive_price() {
        let mut ledger = Ledger::new();
        assert!(ledger
            .open("SPY", 10.0, 0.0, 5, BrokerMode::FullAuto, Utc::now())
            .is_err());
    }

    #[test]
    fn open_rejects_nonpositive_qty() {
        let mut ledger = Ledger::new();
        assert!(ledger
            .open("SPY", 0.0, 100.0, 5, BrokerMode::FullAuto, Utc::now())
            .is_err());
        assert!(ledger
            .open("SPY", -5.0, 100.0, 5, BrokerMode::FullAuto, Utc::now())
            .is_err());
    }

    #[test]
    fn mark_refreshes_peak_but_ignores_bad_prices() {
        let mut ledger = Ledger::new();
        let id = ledger
            .open("SPY", 10.0, 100.0, 5, BrokerMode::FullAuto, Utc::now())
            .unwrap()
            .id
            .clone();
        ledger.mark(&id, 110.0);
        ledger.mark(&id, f64::NAN);
        ledger.mark(&id, -1.0);
        assert_eq!(ledger.get(&id).unwrap().peak_price, 110.0);
    }

    #[test]
    fn double_close_is_rejected() {
        let mut ledger = Ledger::new();
        let id = ledger
            .open("SPY", 10.0, 100.0, 5, BrokerMode::FullAuto, Utc::now())
            .unwrap()
            .id
            .clone();
        ledger
            .close(&id, 105.0, ExitReason::ProfitTarget, Utc::now())
            .unwrap();
        let err = ledger
            .close(&id, 106.0, ExitReason::ProfitTarget, Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("already closed"));
    }

    #[test]
    fn mark_on_closed_position_is_a_noop() {
        let mut ledger = Ledger::new();
        let id = ledger
            .open("SPY", 10.0, 100.0, 5, BrokerMode::FullAuto, Utc::now())
            .unwrap()
            .id
            .clone();
        ledger
            .close(&id, 105.0, ExitReason::ProfitTarget, Utc::now())
            .unwrap();
        ledger.mark(&id, 999.0);
        assert_eq!(ledger.get(&id).unwrap().peak_price, 100.0);
    }

    #[test]
    fn list_open_excludes_closed_positions() {
        let mut ledger = Ledger::new();
        let a = ledger
            .open("SPY", 10.0, 100.0, 5, BrokerMode::FullAuto, Utc::now())
            .unwrap()
            .id
            .clone();
        let b = ledger
            .open("QQQ", 5.0, 50.0, 5, BrokerMode::FullAuto, Utc::now())
            .unwrap()
            .id
            .clone();
        ledger
            .close(&a, 101.0, ExitReason::ProfitTarget, Utc::now())
            .unwrap();
        let open = ledger.list_open();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, b);
    }
}
