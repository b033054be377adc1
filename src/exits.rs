//! Exit strategy evaluation (C6): a priority-ordered fold over tagged exit
//! reasons, evaluated fresh every cycle against the position's updated peak.
//!
//! Grounded on `risk.rs`'s fold-over-weighted-checks shape, restructured per
//! the redesign note into tagged enum variants (see [`crate::models::ExitReason`])
//! evaluated by descending priority rather than as an unordered rule list.

use chrono::{DateTime, Utc};

use crate::config::ExitConfig;
use crate::models::{DefconLevel, ExitReason, Position};

pub struct ExitDecision {
    pub reason: ExitReason,
    pub price: f64,
}

/// Refresh `position.peak_price` against the latest price. Called
/// unconditionally before evaluation, including in `held` mode — a position
/// is still marked even when the orchestrator is not opening new ones.
pub fn refresh_peak(position: &mut Position, price: f64) {
    if price.is_finite() && price > 0.0 {
        position.current_price = price;
        if price > position.peak_price {
            position.peak_price = price;
        }
    }
}

/// Evaluate every exit strategy against the current state and return the
/// highest-priority one that fires, or `None` if the position should stay
/// open. No strategy, including stop-loss, fires inside the minimum-hold
/// window — the guard is unconditional.
pub fn evaluate(
    position: &Position,
    current_defcon: DefconLevel,
    cfg: &ExitConfig,
    now: DateTime<Utc>,
) -> Option<ExitDecision> {
    let hold_minutes = position.hold_time(now).num_seconds() as f64 / 60.0;
    let past_min_hold = hold_minutes >= cfg.min_hold_minutes;
    let pnl = position.pnl_pct(position.current_price);

    let mut candidates: Vec<ExitDecision> = Vec::new();

    if past_min_hold {
        if pnl <= cfg.stop_loss {
            candidates.push(ExitDecision {
                reason: ExitReason::StopLoss,
                price: position.current_price,
            });
        }

        if pnl >= cfg.profit_target {
            candidates.push(ExitDecision {
                reason: ExitReason::ProfitTarget,
                price: position.current_price,
            });
        }

        if position.current_price > position.entry_price {
            let drawdown_from_peak =
                (position.current_price - position.peak_price) / position.peak_price;
            if drawdown_from_peak <= cfg.trailing_stop {
                candidates.push(ExitDecision {
                    reason: ExitReason::TrailingStop,
                    price: position.current_price,
                });
            }
        }

        if position.entry_defcon <= 2 && current_defcon.0 >= 3 {
            candidates.push(ExitDecision {
                reason: ExitReason::DefconRevert,
                price: position.current_price,
            });
        }

        let hold_hours = hold_minutes / 60.0;
        let losing = pnl < 0.0;
        if hold_hours >= cfg.max_hold_hours
            || (hold_hours >= 0.8 * cfg.max_hold_hours && losing)
        {
            candidates.push(ExitDecision {
                reason: ExitReason::TimeLimit,
                price: position.current_price,
            });
        }
    }

    candidates
        .into_iter()
        .max_by_key(|c| c.reason.priority())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open_position(entry_price: f64, entry_defcon: u8, entry_time: DateTime<Utc>) -> Position {
        Position {
            id: "p1".into(),
            symbol: "SPY".into(),
            qty: 10.0,
            entry_price,
            entry_time,
            entry_defcon,
            peak_price: entry_price,
            current_price: entry_price,
            status: crate::models::PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
        }
    }

    #[test]
    fn stop_loss_outranks_profit_target_when_both_would_fire_scenario_1() {
        // Construct an (unrealistic but valid) state where both the
        // stop-loss and profit-target thresholds are simultaneously crossed
        // via peak-then-crash: priority order must pick stop-loss.
        let cfg = ExitConfig::default();
        let now = Utc::now();
        let mut position = open_position(100.0, 5, now - Duration::minutes(120));
        position.peak_price = 130.0; // would have hit profit target on the way up
        position.current_price = 96.0; // now deep in stop-loss territory
        let decision = evaluate(&position, DefconLevel(5), &cfg, now).unwrap();
        assert_eq!(decision.reason, ExitReason::StopLoss);
    }

    #[test]
    fn trailing_stop_protects_gain_after_pullback_scenario_2() {
        let cfg = ExitConfig::default();
        let now = Utc::now();
        let mut position = open_position(100.0, 5, now - Duration::minutes(120));
        position.peak_price = 110.0;
        position.current_price = 107.5; // -2.27% off peak, past -2% trailing stop
        let decision = evaluate(&position, DefconLevel(5), &cfg, now).unwrap();
        assert_eq!(decision.reason, ExitReason::TrailingStop);
    }

    #[test]
    fn defcon_reversion_triggers_exit_when_crisis_passes_scenario_3() {
        let cfg = ExitConfig::default();
        let now = Utc::now();
        let mut position = open_position(100.0, 2, now - Duration::minutes(120));
        position.current_price = 101.0; // small gain, nowhere near profit target
        let decision = evaluate(&position, DefconLevel(5), &cfg, now).unwrap();
        assert_eq!(decision.reason, ExitReason::DefconRevert);
    }

    #[test]
    fn trailing_stop_does_not_fire_on_an_unprofitable_position() {
        // Peak rose above entry but price has since fallen back below entry:
        // the position is no longer "profitable", so trailing_stop must not
        // fire even though the pullback-from-peak threshold is crossed.
        let cfg = ExitConfig::default();
        let now = Utc::now();
        let mut position = open_position(100.0, 5, now - Duration::minutes(120));
        position.peak_price = 102.0;
        position.current_price = 99.5; // -2.45% off peak, but below entry
        assert!(evaluate(&position, DefconLevel(5), &cfg, now).is_none());
    }

    #[test]
    fn defcon_revert_requires_entry_defcon_at_or_below_two() {
        // entry_defcon=4, current=5: current > entry, but entry_defcon is not
        // <= 2, so defcon_revert must not fire.
        let cfg = ExitConfig::default();
        let now = Utc::now();
        let mut position = open_position(100.0, 4, now - Duration::minutes(120));
        position.current_price = 100.5;
        assert!(evaluate(&position, DefconLevel(5), &cfg, now).is_none());
    }

    #[test]
    fn no_strategy_fires_inside_minimum_hold_window_even_past_stop_loss() {
        // §8: "within min_hold: no strategy in C6 returns an exit" is
        // unconditional — a hard loss inside the grace period still waits.
        let cfg = ExitConfig::default();
        let now = Utc::now();
        let mut position = open_position(100.0, 5, now - Duration::minutes(5));
        position.current_price = 95.0;
        assert!(evaluate(&position, DefconLevel(5), &cfg, now).is_none());
    }

    #[test]
    fn no_exit_fires_inside_minimum_hold_window_without_a_stop_loss() {
        let cfg = ExitConfig::default();
        let now = Utc::now();
        let mut position = open_position(100.0, 5, now - Duration::minutes(5));
        position.current_price = 106.0; // past profit target but inside min-hold
        assert!(evaluate(&position, DefconLevel(5), &cfg, now).is_none());
    }

    #[test]
    fn time_limit_fires_after_max_hold_hours() {
        let cfg = ExitConfig::default();
        let now = Utc::now();
        let mut position = open_position(100.0, 5, now - Duration::hours(73));
        position.current_price = 100.5; // no other strategy fires
        let decision = evaluate(&position, DefconLevel(5), &cfg, now).unwrap();
        assert_eq!(decision.reason, ExitReason::TimeLimit);
    }

    #[test]
    fn time_limit_fires_early_when_losing_past_eighty_percent_of_max_hold() {
        let cfg = ExitConfig::default();
        let now = Utc::now();
        // 0.8 * 72h = 57.6h; losing position should exit before the full 72h.
        let mut position = open_position(100.0, 5, now - Duration::minutes(58 * 60));
        position.current_price = 99.0; // losing, but not past stop-loss
        let decision = evaluate(&position, DefconLevel(5), &cfg, now).unwrap();
        assert_eq!(decision.reason, ExitReason::TimeLimit);
    }

    #[test]
    fn no_early_time_limit_when_profitable_past_eighty_percent_of_max_hold() {
        let cfg = ExitConfig::default();
        let now = Utc::now();
        let mut position = open_position(100.0, 5, now - Duration::minutes(58 * 60));
        position.current_price = 100.5; // small gain, below profit target
        assert!(evaluate(&position, DefconLevel(5), &cfg, now).is_none());
    }

    #[test]
    fn refresh_peak_ignores_nonpositive_and_nan_prices() {
        let mut position = open_position(100.0, 5, Utc::now());
        refresh_peak(&mut position, f64::NAN);
        refresh_peak(&mut position, -5.0);
        assert_eq!(position.peak_price, 100.0);
        assert_eq!(position.current_price, 100.0);
    }

    #[test]
    fn refresh_peak_is_monotonic() {
        let mut position = open_position(100.0, 5, Utc::now());
        refresh_peak(&mut position, 120.0);
        refresh_peak(&mut position, 110.0);
        assert_eq!(position.peak_price, 120.0);
        assert_eq!(position.current_price, 110.0);
    }
}
