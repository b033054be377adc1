//! End-to-end exercise of the §8 boundary scenarios against the public
//! library API, using a tempfile-backed `Store` so persistence and restart
//! round-trips go through the real SQLite path instead of the in-memory
//! test-only connection. Mirrors the teacher's `tests/backtest_run_integration.rs`
//! convention of one process-level integration test file driving the library
//! crate directly rather than spawning the compiled binary.

use chrono::{Duration, Utc};

use hightrade::config::{Config, ExitConfig};
use hightrade::exits::{evaluate, refresh_peak};
use hightrade::ledger::Ledger;
use hightrade::models::{BrokerMode, DefconLevel, ExitReason, Position, PositionStatus};
use hightrade::news::dedup::dedupe;
use hightrade::rate_limiter::{CallOutcome, RateLimiter};
use hightrade::store::Store;

fn open_position(entry_price: f64, entry_defcon: u8, entry_time: chrono::DateTime<Utc>) -> Position {
    Position {
        id: "p1".into(),
        symbol: "SPY".into(),
        qty: 10.0,
        entry_price,
        entry_time,
        entry_defcon,
        peak_price: entry_price,
        current_price: entry_price,
        status: PositionStatus::Open,
        exit_price: None,
        exit_time: None,
        exit_reason: None,
    }
}

/// Scenario 1: stop-loss outranks profit-target when both would apply in a
/// single tick (peak-then-crash). Entry $100 at DEFCON 3, marks 103 then 95.
#[test]
fn scenario_1_stop_loss_outranks_profit_target() {
    let cfg = ExitConfig::default();
    let now = Utc::now();
    let mut position = open_position(100.0, 3, now - Duration::minutes(120));

    refresh_peak(&mut position, 103.0);
    refresh_peak(&mut position, 95.0);
    assert_eq!(position.peak_price, 103.0);

    let decision = evaluate(&position, DefconLevel(3), &cfg, now).expect("an exit must fire");
    assert_eq!(decision.reason, ExitReason::StopLoss);
}

/// Scenario 2: trailing stop protects a small gain that never reaches the
/// profit target. Entry $100 at DEFCON 5 (so defcon_revert can never apply),
/// marks 102, 105, 102.8. Peak 105; pullback to -2.095% off peak while still
/// +2.8% up overall, below the 5% profit-target bar, so trailing_stop is the
/// only candidate.
#[test]
fn scenario_2_trailing_stop_protects_gain() {
    let cfg = ExitConfig::default();
    let now = Utc::now();
    let mut position = open_position(100.0, 5, now - Duration::minutes(120));

    for price in [102.0, 105.0, 102.8] {
        refresh_peak(&mut position, price);
    }
    assert_eq!(position.peak_price, 105.0);

    let decision = evaluate(&position, DefconLevel(5), &cfg, now).expect("an exit must fire");
    assert_eq!(decision.reason, ExitReason::TrailingStop);
    let pnl = position.pnl_pct(decision.price);
    assert!((pnl - 0.028).abs() < 0.001, "pnl_pct was {pnl}");
}

/// Scenario 3: DEFCON reversion exit. Entry at DEFCON 2, next cycle current
/// DEFCON 3, position up +1% — no other strategy should outrank it.
#[test]
fn scenario_3_defcon_reversion() {
    let cfg = ExitConfig::default();
    let now = Utc::now();
    let mut position = open_position(100.0, 2, now - Duration::minutes(120));
    refresh_peak(&mut position, 101.0);

    let decision = evaluate(&position, DefconLevel(3), &cfg, now).expect("an exit must fire");
    assert_eq!(decision.reason, ExitReason::DefconRevert);
}

/// Scenario 5: dedup cluster pick — A(rel=0.4), B(rel=0.9, pub 10:02),
/// C(rel=0.9, pub 10:01) mutually similar -> keep C (tie on relevance broken
/// by earliest publish time).
#[test]
fn scenario_5_dedup_cluster_keeps_earliest_of_tied_relevance() {
    use chrono::TimeZone;
    use hightrade::models::Article;

    let shared_body =
        "global markets face turmoil amid banking sector stress and bond yield spikes worldwide";
    let mut a = Article::new(
        "s",
        "Global banking turmoil spreads across markets",
        "https://example.com/a",
        Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap(),
        shared_body,
    );
    a.relevance = 0.4;
    let mut b = Article::new(
        "s",
        "Global banking turmoil spreads across markets worldwide",
        "https://example.com/b",
        Utc.with_ymd_and_hms(2026, 1, 1, 10, 2, 0).unwrap(),
        shared_body,
    );
    b.relevance = 0.9;
    let mut c = Article::new(
        "s",
        "Global banking turmoil spreads across world markets",
        "https://example.com/c",
        Utc.with_ymd_and_hms(2026, 1, 1, 10, 1, 0).unwrap(),
        shared_body,
    );
    c.relevance = 0.9;

    let out = dedupe(&[a, b.clone(), c.clone()], 0.3);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].id, c.id);
}

/// Scenario 6: rate-limit backoff. rpm=5, min_ms=12000, three consecutive
/// 429s at t=0,12s,24s -> fourth call permitted no earlier than
/// t = 24 + min(2^3, 300) = 32s out from the third failure.
#[test]
fn scenario_6_rate_limit_backoff_matches_formula() {
    let mut defaults = std::collections::HashMap::new();
    defaults.insert(
        "alpha_vantage_news".to_string(),
        hightrade::config::RateLimitConfig {
            rpm: 5,
            min_ms: 12_000,
        },
    );
    let limiter = RateLimiter::new(defaults);

    for k in 1..=3u32 {
        limiter.record("alpha_vantage_news", CallOutcome::RateLimited);
        let expected_secs = 2i64.pow(k).min(300);
        let next = limiter.next_allowed_at("alpha_vantage_news").unwrap();
        let delta = (next - Utc::now()).num_seconds();
        assert!((delta - expected_secs).abs() <= 1, "k={k} got delta={delta}");
    }
}

/// Round-trip: persist a Position to a real SQLite file, reopen the store
/// (simulating a process restart), and confirm `peak_price`/`entry_defcon`
/// survive unchanged.
#[tokio::test]
async fn position_round_trips_across_a_simulated_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("hightrade.db");
    let db_path_str = db_path.to_str().unwrap().to_string();

    let mut position = open_position(100.0, 2, Utc::now() - Duration::hours(1));
    refresh_peak(&mut position, 125.0);
    refresh_peak(&mut position, 118.0);

    {
        let store = Store::open(&db_path_str).await.unwrap();
        store.save_position(&position).await.unwrap();
    }

    // Reopen — the prior connection is dropped, a fresh one is opened
    // against the same file, exactly as a restarted orchestrator would.
    let store = Store::open(&db_path_str).await.unwrap();
    let loaded = store.load_positions().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].peak_price, 125.0);
    assert_eq!(loaded[0].entry_defcon, 2);
    assert_eq!(loaded[0].current_price, 118.0);
}

/// Min-hold guard: no exit strategy fires inside the minimum-hold window,
/// even a hard stop-loss, and the ledger/exit pipeline behave the same way
/// whether the position came straight from `Ledger::open` or from a reload.
#[test]
fn no_exit_within_min_hold_window_end_to_end() {
    let cfg = ExitConfig::default();
    let mut ledger = Ledger::new();
    let now = Utc::now();
    let id = ledger
        .open("SPY", 10.0, 100.0, 5, BrokerMode::FullAuto, now - Duration::minutes(5))
        .unwrap()
        .id
        .clone();
    ledger.mark(&id, 90.0); // deep in stop-loss territory, but inside min-hold
    let position = ledger.get(&id).unwrap();
    assert!(evaluate(position, DefconLevel(5), &cfg, now).is_none());
}

/// `held` mode: the default config's broker mode starts `disabled`, matching
/// a monitoring-only deployment where entries never execute.
#[test]
fn default_config_starts_in_disabled_broker_mode() {
    let cfg = Config::default();
    assert_eq!(cfg.broker_mode, "disabled");
}
