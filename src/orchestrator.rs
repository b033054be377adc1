//! The scheduler (C11): a cooperative event loop that runs one monitoring
//! cycle per interval and polls the command queue in between.
//!
//! Grounded on `main.rs`'s overall wiring (construct every collaborator,
//! hand them to one long-running loop) and `vault/engine.rs::VaultEngineConfig`
//! + `spawn()`'s "struct of collaborators with one `run` entry point" shape.

use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::alerts::{AlertEvent, AlertRouter, TopArticleSummary};
use crate::command_ipc::{Command, CommandQueue};
use crate::config::Config;
use crate::exits::evaluate as evaluate_exits;
use crate::ledger::Ledger;
use crate::market::MarketClient;
use crate::models::{
    BrokerMode, DecisionKind, DecisionStatus, DefconLevel, DefconState, MarketSnapshot,
    OrchestratorState, PendingDecision, RunMode,
};
use crate::news::aggregator::{build_signal, is_novel, NewsAggregator};
use crate::scoring::score_cycle;
use crate::store::Store;

pub struct Orchestrator {
    cfg: Config,
    store: Store,
    news: NewsAggregator,
    market: MarketClient,
    alerts: AlertRouter,
    commands: CommandQueue,
    ledger: Ledger,
    state: OrchestratorState,
}

impl Orchestrator {
    pub async fn new(
        cfg: Config,
        store: Store,
        news: NewsAggregator,
        market: MarketClient,
        alerts: AlertRouter,
    ) -> anyhow::Result<Self> {
        let commands = CommandQueue::new(cfg.commands_dir.clone(), cfg.in_flight_reclaim_minutes);
        commands.ensure_dirs()?;
        commands.reclaim_stale()?;

        let positions = store.load_positions().await?;
        let ledger = Ledger::load(positions);

        let mut state = store
            .load_orchestrator_state()
            .await?
            .unwrap_or_default();
        state.cycle_interval_sec = cfg.cycle_interval_sec;
        state.broker_mode = BrokerMode::from_str_loose(&cfg.broker_mode).unwrap_or(BrokerMode::Disabled);

        Ok(Self {
            cfg,
            store,
            news,
            market,
            alerts,
            commands,
            ledger,
            state,
        })
    }

    /// Main loop: run a cycle when due, then poll for commands until the
    /// next cycle is due or a command demands immediate action.
    ///
    /// Per §7, the cycle is the atomic failure unit: nothing short of a
    /// failure to even begin the next iteration may escape this loop. A
    /// failed `run_cycle`/`poll_until` is logged and the loop carries on
    /// rather than returning `Err` up to `main`.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            if self.state.mode == RunMode::ShuttingDown {
                info!("orchestrator_shutdown_complete");
                return Ok(());
            }

            if self.state.mode == RunMode::Running || self.state.mode == RunMode::Held {
                if let Err(e) = self.run_cycle().await {
                    error!(error = %e, "cycle_failed_continuing");
                }
            }

            self.persist_orchestrator_state().await;

            let sleep_until = Utc::now()
                + chrono::Duration::seconds(self.state.cycle_interval_sec as i64);
            if let Err(e) = self.poll_until(sleep_until).await {
                error!(error = %e, "command_poll_failed_continuing");
            }

            if self.state.mode == RunMode::ShuttingDown {
                info!("orchestrator_shutdown_complete");
                return Ok(());
            }
        }
    }

    /// Write `value` to the spill directory as a standalone JSON file so a
    /// cycle's artifacts survive a second consecutive persistence failure
    /// instead of being dropped (§7 "persistence write failure").
    async fn spill_artifact<T: serde::Serialize>(&self, label: &str, value: &T) {
        if let Err(e) = tokio::fs::create_dir_all(&self.cfg.spill_dir).await {
            error!(error = %e, dir = %self.cfg.spill_dir, "spill_dir_create_failed");
            return;
        }
        let path = std::path::Path::new(&self.cfg.spill_dir)
            .join(format!("{label}-{}.json", uuid::Uuid::new_v4()));
        match serde_json::to_vec_pretty(value) {
            Ok(body) => {
                if let Err(e) = tokio::fs::write(&path, body).await {
                    error!(error = %e, path = %path.display(), "spill_write_failed");
                } else {
                    warn!(path = %path.display(), label, "cycle_artifact_spilled");
                }
            }
            Err(e) => error!(error = %e, label, "spill_serialize_failed"),
        }
    }

    async fn persist_news_signal(&self, signal: &crate::models::NewsSignal) {
        if let Err(e) = self.store.save_news_signal(signal).await {
            warn!(error = %e, "news_signal_write_failed_retrying");
            if let Err(e2) = self.store.save_news_signal(signal).await {
                error!(error = %e2, "news_signal_write_failed_twice_spilling");
                self.spill_artifact("news_signal", signal).await;
            }
        }
    }

    async fn persist_market_snapshot(&self, snapshot: &crate::models::MarketSnapshot) {
        if let Err(e) = self.store.save_market_snapshot(snapshot).await {
            warn!(error = %e, "market_snapshot_write_failed_retrying");
            if let Err(e2) = self.store.save_market_snapshot(snapshot).await {
                error!(error = %e2, "market_snapshot_write_failed_twice_spilling");
                self.spill_artifact("market_snapshot", snapshot).await;
            }
        }
    }

    async fn persist_defcon_state(&self, state: &crate::models::DefconState) {
        if let Err(e) = self.store.append_defcon_state(state).await {
            warn!(error = %e, "defcon_state_write_failed_retrying");
            if let Err(e2) = self.store.append_defcon_state(state).await {
                error!(error = %e2, "defcon_state_write_failed_twice_spilling");
                self.spill_artifact("defcon_state", state).await;
            }
        }
    }

    async fn persist_position(&self, position: &crate::models::Position) {
        if let Err(e) = self.store.save_position(position).await {
            warn!(error = %e, position_id = %position.id, "position_write_failed_retrying");
            if let Err(e2) = self.store.save_position(position).await {
                error!(error = %e2, position_id = %position.id, "position_write_failed_twice_spilling");
                self.spill_artifact("position", position).await;
            }
        }
    }

    async fn persist_orchestrator_state(&self) {
        if let Err(e) = self.store.save_orchestrator_state(&self.state).await {
            warn!(error = %e, "orchestrator_state_write_failed_retrying");
            if let Err(e2) = self.store.save_orchestrator_state(&self.state).await {
                error!(error = %e2, "orchestrator_state_write_failed_twice_spilling");
                self.spill_artifact("orchestrator_state", &self.state).await;
            }
        }
    }

    /// Poll the command queue at `ipc_poll_ms` cadence until `deadline`, or
    /// until a `refresh`/`shutdown`/`estop` command short-circuits the wait.
    async fn poll_until(&mut self, deadline: chrono::DateTime<Utc>) -> anyhow::Result<()> {
        loop {
            if Utc::now() >= deadline {
                return Ok(());
            }
            if let Some((path, body)) = self.commands.claim_next()? {
                match Command::parse(&body) {
                    Ok(parsed) => {
                        let early_exit = self.apply_command(parsed).await?;
                        self.commands.complete(&path)?;
                        if early_exit {
                            return Ok(());
                        }
                    }
                    Err(_) => {
                        warn!(body, "command_parse_error_quarantined");
                        self.commands.fail(&path, &body, "unrecognized verb or malformed json")?;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(self.cfg.ipc_poll_ms)).await;
        }
    }

    /// Returns `true` if handling this command should end the current poll
    /// window early (refresh/shutdown/estop).
    async fn apply_command(&mut self, parsed: Command) -> anyhow::Result<bool> {
        match parsed {
            Command::Status | Command::Portfolio | Command::Defcon => {
                // Read-only introspection commands are served by the
                // `hightradectl` CLI querying the store directly; nothing to
                // mutate here.
                Ok(false)
            }
            Command::Hold => {
                self.state.mode = RunMode::Held;
                Ok(false)
            }
            Command::Resume => {
                if self.state.mode == RunMode::Held {
                    self.state.mode = RunMode::Running;
                }
                Ok(false)
            }
            Command::Yes => self.resolve_pending_decision(true).await,
            Command::No => self.resolve_pending_decision(false).await,
            Command::Refresh => Ok(true),
            Command::Shutdown => {
                self.state.mode = RunMode::ShuttingDown;
                self.alerts
                    .route(AlertEvent::CommandResponse {
                        timestamp: Utc::now(),
                        verb: "shutdown".into(),
                        accepted: true,
                        detail: "draining current cycle then exiting".into(),
                    })
                    .await;
                Ok(true)
            }
            Command::EStop => {
                self.state.mode = RunMode::EStopped;
                self.alerts
                    .route(AlertEvent::CommandResponse {
                        timestamp: Utc::now(),
                        verb: "estop".into(),
                        accepted: true,
                        detail: "emergency stop engaged".into(),
                    })
                    .await;
                Ok(true)
            }
            Command::Mode(mode) => {
                if let Some(broker_mode) = BrokerMode::from_str_loose(&mode) {
                    self.state.broker_mode = broker_mode;
                } else {
                    warn!(mode, "command_mode_invalid_state");
                }
                Ok(false)
            }
            Command::Interval(minutes) => {
                self.state.cycle_interval_sec = minutes * 60;
                Ok(false)
            }
        }
    }

    /// Approve or reject the single active entry [`PendingDecision`]. Per §6,
    /// `yes`/`no` with nothing awaiting is an invalid-state command — we
    /// surface that as an urgent command response rather than failing the
    /// poll loop. Per §4.7, approving an `Entry` decision must actually open
    /// the position — `disabled` broker mode files the decision instead of
    /// opening immediately, but approval is the point it executes.
    async fn resolve_pending_decision(&mut self, approve: bool) -> anyhow::Result<bool> {
        let verb = if approve { "yes" } else { "no" };
        let mut awaiting = self.store.load_awaiting_decisions().await?;
        let Some(decision) = awaiting.pop() else {
            self.alerts
                .route(AlertEvent::CommandResponse {
                    timestamp: Utc::now(),
                    verb: verb.into(),
                    accepted: false,
                    detail: "no pending decision".into(),
                })
                .await;
            return Ok(false);
        };

        let mut decision = decision;
        decision.status = if approve {
            crate::models::DecisionStatus::Approved
        } else {
            crate::models::DecisionStatus::Rejected
        };
        self.store.save_pending_decision(&decision).await?;

        let mut detail = format!(
            "decision {} {}",
            decision.id,
            if approve { "approved" } else { "rejected" }
        );
        if approve && decision.kind == DecisionKind::Entry {
            match self.execute_approved_entry(&decision.subject).await {
                Ok(symbol) => detail = format!("{detail}, opened {symbol}"),
                Err(e) => {
                    error!(error = %e, decision_id = %decision.id, "approved_entry_execution_failed");
                    detail = format!("{detail}, but failed to open: {e}");
                }
            }
        }

        self.alerts
            .route(AlertEvent::CommandResponse {
                timestamp: Utc::now(),
                verb: verb.into(),
                accepted: true,
                detail,
            })
            .await;
        Ok(false)
    }

    /// Open the position behind an approved `Entry` decision. `subject` is
    /// `"{symbol}@{price}"`, set by `propose_entry` when it files the
    /// decision. Returns the symbol on success.
    async fn execute_approved_entry(&mut self, subject: &str) -> anyhow::Result<String> {
        let (symbol, price_str) = subject
            .split_once('@')
            .ok_or_else(|| anyhow::anyhow!("malformed decision subject: {subject}"))?;
        let price: f64 = price_str
            .parse()
            .map_err(|_| anyhow::anyhow!("malformed decision price: {price_str}"))?;

        let now = Utc::now();
        let qty = self.cfg.entry.default_qty;
        let entry_defcon = self
            .store
            .load_latest_defcon_state()
            .await?
            .map(|s| s.level.0)
            .unwrap_or_else(|| crate::models::DefconLevel::peacetime().0);

        // This path only runs for a decision filed under `disabled` broker
        // mode (semi/full-auto never file a PendingDecision — they open
        // immediately). `Ledger::open` rejects `Disabled` outright, so the
        // human approval stands in for a `semi_auto` authorization here.
        let id = {
            let position = self
                .ledger
                .open(symbol, qty, price, entry_defcon, BrokerMode::SemiAuto, now)?;
            position.id.clone()
        };
        if let Some(position) = self.ledger.get(&id) {
            self.persist_position(position).await;
        }
        self.alerts
            .route(AlertEvent::TradeEntry {
                timestamp: now,
                symbols: vec![symbol.to_string()],
                size: qty,
                defcon: entry_defcon,
                pending: false,
            })
            .await;
        Ok(symbol.to_string())
    }

    /// One monitoring cycle. Ordering is load-bearing: snapshot and signal
    /// are persisted before the DEFCON transition is persisted, which is
    /// persisted before the exit evaluator runs, which completes before any
    /// exit alert is emitted.
    async fn run_cycle(&mut self) -> anyhow::Result<()> {
        self.state.cycle_count += 1;
        self.state.last_cycle_start = Some(Utc::now());
        let cycle_id = self.state.cycle_count as i64;

        let news_fetch = self.news.fetch_cycle(&self.cfg);
        let market_fetch = self.market.snapshot(&self.cfg);
        let (articles, snapshot) = tokio::join!(news_fetch, market_fetch);

        let last_signal = self.store.load_last_news_signal().await;
        let (last_top_ids, last_read_ok) = match &last_signal {
            Ok(Some(signal)) => (signal.top_articles.clone(), true),
            Ok(None) => (vec![], true),
            Err(_) => (vec![], false),
        };
        let novel = is_novel(&articles, &last_top_ids, last_read_ok);
        let new_article_count = {
            let last: std::collections::HashSet<&str> =
                last_top_ids.iter().map(|s| s.as_str()).collect();
            articles.iter().filter(|a| !last.contains(a.id.as_str())).count()
        };

        let signal = build_signal(cycle_id, &articles);
        self.persist_news_signal(&signal).await;
        self.persist_market_snapshot(&snapshot).await;

        let previous_defcon = match self.store.load_latest_defcon_state().await {
            Ok(state) => state.map(|s| s.level).unwrap_or_else(crate::models::DefconLevel::peacetime),
            Err(e) => {
                warn!(error = %e, "defcon_state_read_failed_assuming_peacetime");
                crate::models::DefconLevel::peacetime()
            }
        };

        let scored = score_cycle(&signal, &snapshot, &self.cfg.defcon_weights);
        if scored.level != previous_defcon {
            let defcon_state = DefconState {
                level: scored.level,
                signal_score: scored.score,
                entered_at: Utc::now(),
                reason_code: scored.reason_code.clone(),
            };
            self.persist_defcon_state(&defcon_state).await;
            self.alerts
                .route(AlertEvent::DefconChange {
                    timestamp: Utc::now(),
                    from: previous_defcon.0,
                    to: scored.level.0,
                    signal_score: scored.score,
                    reason_code: scored.reason_code.clone(),
                })
                .await;
        }

        if novel {
            let mut ranked: Vec<&crate::models::Article> = articles.iter().collect();
            ranked.sort_by(|a, b| {
                b.relevance
                    .partial_cmp(&a.relevance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let top = ranked
                .iter()
                .take(5)
                .map(|a| TopArticleSummary::from_article(a))
                .collect();

            self.alerts
                .route(AlertEvent::NewsUpdate {
                    timestamp: Utc::now(),
                    score: signal.score,
                    crisis_type: signal.crisis_type.as_str().to_string(),
                    sentiment_label: signal.sentiment_dist.label().to_string(),
                    article_count: signal.article_count,
                    new_article_count,
                    breaking_count: signal.breaking_count,
                    top,
                })
                .await;
        }

        self.evaluate_and_apply_exits(scored.level, &snapshot).await;

        // Entry proposals only happen while `running`: `held` mode keeps
        // marking/exiting existing positions but never opens new ones (§4.11).
        if self.state.mode == RunMode::Running
            && scored.level != previous_defcon
            && scored.level.0 <= self.cfg.entry.defcon_trigger
        {
            if let Err(e) = self.propose_entries(scored.level, &snapshot).await {
                error!(error = %e, "entry_proposal_failed");
            }
        }

        let holdings = self
            .ledger
            .list_open()
            .iter()
            .map(|p| p.symbol.clone())
            .collect();

        self.alerts
            .route(AlertEvent::CycleSummary {
                timestamp: Utc::now(),
                defcon: scored.level.0,
                signal_score: scored.score,
                vix: snapshot.vix,
                yield_10y: snapshot.bond_yield_10y,
                sp500_pct: snapshot.sp500_change_pct,
                holdings,
            })
            .await;

        Ok(())
    }

    /// Mark every open position to the latest snapshot, then evaluate exit
    /// strategies. Runs in `held` mode too — monitoring and risk management
    /// never stop, only new entries do.
    async fn evaluate_and_apply_exits(
        &mut self,
        defcon_level: crate::models::DefconLevel,
        snapshot: &crate::models::MarketSnapshot,
    ) {
        if snapshot.stale {
            warn!("market_snapshot_stale_skipping_new_entries");
        }

        let open_ids: Vec<String> = self
            .ledger
            .list_open()
            .iter()
            .map(|p| p.id.clone())
            .collect();

        for id in open_ids {
            let symbol = self.ledger.get(&id).map(|p| p.symbol.clone());
            let Some(symbol) = symbol else { continue };
            let Some(price) = snapshot.per_symbol_price.get(&symbol).copied() else {
                continue;
            };
            self.ledger.mark(&id, price);

            let Some(position) = self.ledger.get(&id) else {
                continue;
            };
            if let Some(decision) = evaluate_exits(position, defcon_level, &self.cfg.exit, Utc::now())
            {
                let pnl_pct = position.pnl_pct(decision.price);
                // Invariant violation (e.g. double-close): log and move on
                // rather than aborting the rest of the cycle (§7).
                if let Err(e) = self.ledger.close(&id, decision.price, decision.reason, Utc::now()) {
                    error!(error = %e, position_id = %id, "exit_close_invariant_violation");
                    continue;
                }
                if let Some(closed) = self.ledger.get(&id) {
                    self.persist_position(closed).await;
                }
                self.alerts
                    .route(AlertEvent::TradeExit {
                        timestamp: Utc::now(),
                        symbol,
                        reason: decision.reason.as_str().to_string(),
                        pnl_pct,
                    })
                    .await;
            } else if let Some(open_position) = self.ledger.get(&id) {
                self.persist_position(open_position).await;
            }
        }
    }

    /// Propose one entry per configured symbol not already held, on the
    /// cycle the DEFCON level first degrades into crisis territory (§4.6's
    /// `defcon_revert` exit is this proposal's mirror image: it closes the
    /// position once the level later recovers). Refuses to propose from a
    /// stale snapshot — the ledger must never open on a synthetic price.
    async fn propose_entries(
        &mut self,
        defcon_level: DefconLevel,
        snapshot: &MarketSnapshot,
    ) -> anyhow::Result<()> {
        if snapshot.stale {
            warn!("market_snapshot_stale_skipping_entry_proposals");
            return Ok(());
        }

        let open_symbols: std::collections::HashSet<String> = self
            .ledger
            .list_open()
            .iter()
            .map(|p| p.symbol.clone())
            .collect();

        for symbol in self.cfg.market_symbols.clone() {
            if open_symbols.contains(&symbol) {
                continue;
            }
            let Some(price) = snapshot.per_symbol_price.get(&symbol).copied() else {
                continue;
            };
            self.propose_entry(&symbol, price, defcon_level.0).await?;
        }
        Ok(())
    }

    /// Apply one proposed entry per the broker-mode gate of §4.7: `disabled`
    /// files a [`PendingDecision`] awaiting `yes`/`no`; `semi_auto` and
    /// `full_auto` open the position immediately (the only difference
    /// between those two is urgency-channel routing, already encoded in
    /// [`AlertEvent::channels`]).
    async fn propose_entry(&mut self, symbol: &str, price: f64, defcon: u8) -> anyhow::Result<()> {
        let now = Utc::now();
        match self.state.broker_mode {
            BrokerMode::Disabled => {
                // Single active entry decision at a time (§3 invariant).
                let awaiting = self.store.load_awaiting_decisions().await?;
                if awaiting.iter().any(|d| d.kind == DecisionKind::Entry) {
                    return Ok(());
                }
                let decision = PendingDecision {
                    id: uuid::Uuid::new_v4().to_string(),
                    kind: DecisionKind::Entry,
                    subject: format!("{symbol}@{price}"),
                    created_at: now,
                    expires_at: now
                        + chrono::Duration::minutes(self.cfg.entry.pending_expiry_minutes),
                    status: DecisionStatus::Awaiting,
                };
                self.store.save_pending_decision(&decision).await?;
                self.alerts
                    .route(AlertEvent::TradeEntry {
                        timestamp: now,
                        symbols: vec![symbol.to_string()],
                        size: self.cfg.entry.default_qty,
                        defcon,
                        pending: true,
                    })
                    .await;
            }
            BrokerMode::SemiAuto | BrokerMode::FullAuto => {
                let qty = self.cfg.entry.default_qty;
                let id = {
                    let position = self
                        .ledger
                        .open(symbol, qty, price, defcon, self.state.broker_mode, now)?;
                    position.id.clone()
                };
                if let Some(position) = self.ledger.get(&id) {
                    self.persist_position(position).await;
                }
                self.alerts
                    .route(AlertEvent::TradeEntry {
                        timestamp: now,
                        symbols: vec![symbol.to_string()],
                        size: qty,
                        defcon,
                        pending: false,
                    })
                    .await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LoggingTransport;
    use crate::rate_limiter::RateLimiter;

    async fn test_orchestrator() -> Orchestrator {
        let cfg = Config::default();
        let store = Store::open_in_memory().await.unwrap();
        let limiter = RateLimiter::new(cfg.rate_limits.clone());
        let news = NewsAggregator::new(limiter.clone());
        let market = MarketClient::new(limiter);
        let alerts = AlertRouter::new(Box::new(LoggingTransport));
        Orchestrator::new(cfg, store, news, market, alerts)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn hold_command_suspends_new_entries_but_keeps_mode_held() {
        let mut orch = test_orchestrator().await;
        orch.apply_command(Command::Hold).await.unwrap();
        assert_eq!(orch.state.mode, RunMode::Held);
    }

    #[tokio::test]
    async fn resume_from_held_returns_to_running() {
        let mut orch = test_orchestrator().await;
        orch.apply_command(Command::Hold).await.unwrap();
        orch.apply_command(Command::Resume).await.unwrap();
        assert_eq!(orch.state.mode, RunMode::Running);
    }

    #[tokio::test]
    async fn resume_is_a_noop_outside_held_mode() {
        let mut orch = test_orchestrator().await;
        orch.apply_command(Command::Resume).await.unwrap();
        assert_eq!(orch.state.mode, RunMode::Running);
    }

    #[tokio::test]
    async fn estop_short_circuits_poll_and_sets_mode() {
        let mut orch = test_orchestrator().await;
        let early_exit = orch.apply_command(Command::EStop).await.unwrap();
        assert!(early_exit);
        assert_eq!(orch.state.mode, RunMode::EStopped);
    }

    #[tokio::test]
    async fn shutdown_short_circuits_poll_and_sets_mode() {
        let mut orch = test_orchestrator().await;
        let early_exit = orch.apply_command(Command::Shutdown).await.unwrap();
        assert!(early_exit);
        assert_eq!(orch.state.mode, RunMode::ShuttingDown);
    }

    #[tokio::test]
    async fn unknown_verb_is_rejected_before_reaching_apply() {
        assert_eq!(
            Command::parse(&serde_json::to_string(&crate::command_ipc::CommandFile::new("not_a_verb", vec![])).unwrap()),
            Err(crate::command_ipc::ExitCode::UnknownVerb)
        );
    }

    #[tokio::test]
    async fn mode_command_updates_broker_mode() {
        let mut orch = test_orchestrator().await;
        orch.apply_command(Command::Mode("full_auto".into())).await.unwrap();
        assert_eq!(orch.state.broker_mode, BrokerMode::FullAuto);
    }

    #[tokio::test]
    async fn mode_command_with_invalid_state_is_rejected() {
        let mut orch = test_orchestrator().await;
        orch.apply_command(Command::Mode("nonsense".into())).await.unwrap();
        assert_eq!(orch.state.broker_mode, BrokerMode::Disabled);
    }

    #[tokio::test]
    async fn interval_command_updates_cycle_interval() {
        let mut orch = test_orchestrator().await;
        orch.apply_command(Command::Interval(30)).await.unwrap();
        assert_eq!(orch.state.cycle_interval_sec, 1800);
    }

    #[tokio::test]
    async fn malformed_command_file_is_quarantined_to_failed_dir() {
        let mut orch = test_orchestrator().await;
        orch.commands
            .submit(&crate::command_ipc::CommandFile::new("not_a_verb", vec![]))
            .unwrap();
        let deadline = Utc::now() + chrono::Duration::milliseconds(50);
        orch.poll_until(deadline).await.unwrap();
        assert_eq!(orch.state.mode, RunMode::Running);
    }

    fn stub_snapshot(symbol: &str, price: f64, stale: bool) -> crate::models::MarketSnapshot {
        let mut per_symbol_price = std::collections::BTreeMap::new();
        per_symbol_price.insert(symbol.to_string(), price);
        crate::models::MarketSnapshot {
            timestamp: Utc::now(),
            vix: 30.0,
            bond_yield_10y: 3.5,
            sp500_change_pct: -2.0,
            per_symbol_price,
            stale,
        }
    }

    #[tokio::test]
    async fn disabled_broker_mode_files_pending_decision_instead_of_opening() {
        let mut orch = test_orchestrator().await;
        orch.cfg.market_symbols = vec!["SPY".into()];
        let snapshot = stub_snapshot("SPY", 400.0, false);
        orch.propose_entries(DefconLevel(2), &snapshot).await.unwrap();
        assert!(orch.ledger.list_open().is_empty());
        let awaiting = orch.store.load_awaiting_decisions().await.unwrap();
        assert_eq!(awaiting.len(), 1);
        assert_eq!(awaiting[0].kind, DecisionKind::Entry);
    }

    #[tokio::test]
    async fn approving_a_disabled_mode_entry_decision_opens_the_position() {
        let mut orch = test_orchestrator().await;
        orch.cfg.market_symbols = vec!["SPY".into()];
        let snapshot = stub_snapshot("SPY", 400.0, false);
        orch.propose_entries(DefconLevel(2), &snapshot).await.unwrap();
        assert!(orch.ledger.list_open().is_empty());

        orch.apply_command(Command::Yes).await.unwrap();

        let open = orch.ledger.list_open();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "SPY");
        assert_eq!(open[0].entry_price, 400.0);
        let awaiting = orch.store.load_awaiting_decisions().await.unwrap();
        assert!(awaiting.is_empty());
    }

    #[tokio::test]
    async fn rejecting_a_disabled_mode_entry_decision_never_opens_a_position() {
        let mut orch = test_orchestrator().await;
        orch.cfg.market_symbols = vec!["SPY".into()];
        let snapshot = stub_snapshot("SPY", 400.0, false);
        orch.propose_entries(DefconLevel(2), &snapshot).await.unwrap();

        orch.apply_command(Command::No).await.unwrap();

        assert!(orch.ledger.list_open().is_empty());
    }

    #[tokio::test]
    async fn disabled_broker_mode_never_files_a_second_concurrent_decision() {
        let mut orch = test_orchestrator().await;
        orch.cfg.market_symbols = vec!["SPY".into(), "QQQ".into()];
        let mut snapshot = stub_snapshot("SPY", 400.0, false);
        snapshot.per_symbol_price.insert("QQQ".to_string(), 300.0);
        orch.propose_entries(DefconLevel(2), &snapshot).await.unwrap();
        let awaiting = orch.store.load_awaiting_decisions().await.unwrap();
        assert_eq!(awaiting.len(), 1, "only one active entry decision at a time");
    }

    #[tokio::test]
    async fn full_auto_broker_mode_opens_position_immediately() {
        let mut orch = test_orchestrator().await;
        orch.state.broker_mode = BrokerMode::FullAuto;
        orch.cfg.market_symbols = vec!["SPY".into()];
        let snapshot = stub_snapshot("SPY", 400.0, false);
        orch.propose_entries(DefconLevel(2), &snapshot).await.unwrap();
        let open = orch.ledger.list_open();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, "SPY");
        assert_eq!(open[0].entry_price, 400.0);
        assert_eq!(open[0].entry_defcon, 2);
        let awaiting = orch.store.load_awaiting_decisions().await.unwrap();
        assert!(awaiting.is_empty());
    }

    #[tokio::test]
    async fn stale_snapshot_skips_entry_proposals_entirely() {
        let mut orch = test_orchestrator().await;
        orch.state.broker_mode = BrokerMode::FullAuto;
        orch.cfg.market_symbols = vec!["SPY".into()];
        let snapshot = stub_snapshot("SPY", 400.0, true);
        orch.propose_entries(DefconLevel(2), &snapshot).await.unwrap();
        assert!(orch.ledger.list_open().is_empty());
    }

    #[tokio::test]
    async fn already_held_symbol_is_not_proposed_again() {
        let mut orch = test_orchestrator().await;
        orch.state.broker_mode = BrokerMode::FullAuto;
        orch.cfg.market_symbols = vec!["SPY".into()];
        orch.ledger
            .open("SPY", 10.0, 380.0, 3, BrokerMode::FullAuto, Utc::now())
            .unwrap();
        let snapshot = stub_snapshot("SPY", 400.0, false);
        orch.propose_entries(DefconLevel(2), &snapshot).await.unwrap();
        assert_eq!(orch.ledger.list_open().len(), 1);
        assert_eq!(orch.ledger.list_open()[0].entry_price, 380.0);
    }
}
