//! Alert router (C9): two channels (urgent / silent), stable event payload
//! schemas, at-most-once best-effort delivery via an injected transport.
//!
//! Grounded on `main.rs`'s `tokio::sync::broadcast<WsServerEvent>` fan-out —
//! same "serialize a typed event, hand it to a transport, never let delivery
//! failure block the caller" shape, generalized from one broadcast channel to
//! two priority channels plus a pluggable [`AlertTransport`]. Unlike the
//! teacher's single channel, §4.9's fanout table routes several event kinds
//! onto *both* channels at once (e.g. a DEFCON escalation is always logged to
//! the audit trail and also paged urgently) — [`AlertEvent::channels`] is the
//! single place that encodes the table, so routing never drifts from it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config::AlertsConfig;

/// Which channel an event is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Urgent,
    Silent,
}

impl Channel {
    fn as_str(&self) -> &'static str {
        match self {
            Channel::Urgent => "urgent",
            Channel::Silent => "silent",
        }
    }
}

/// One retained article surfaced in a [`AlertEvent::NewsUpdate`] payload.
#[derive(Debug, Clone, Serialize)]
pub struct TopArticleSummary {
    pub source: String,
    pub title: String,
    pub urgency: String,
}

impl TopArticleSummary {
    pub fn from_article(article: &crate::models::Article) -> Self {
        let title: String = article.title.chars().take(80).collect();
        Self {
            source: article.source.clone(),
            title,
            urgency: article.urgency.as_str().to_string(),
        }
    }
}

/// §6 stable payload schemas, one variant per event kind.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertEvent {
    CycleSummary {
        timestamp: DateTime<Utc>,
        defcon: u8,
        signal_score: f64,
        vix: f64,
        yield_10y: f64,
        sp500_pct: f64,
        holdings: Vec<String>,
    },
    DefconChange {
        timestamp: DateTime<Utc>,
        from: u8,
        to: u8,
        signal_score: f64,
        reason_code: String,
    },
    TradeEntry {
        timestamp: DateTime<Utc>,
        symbols: Vec<String>,
        size: f64,
        defcon: u8,
        pending: bool,
    },
    TradeExit {
        timestamp: DateTime<Utc>,
        symbol: String,
        reason: String,
        pnl_pct: f64,
    },
    NewsUpdate {
        timestamp: DateTime<Utc>,
        score: f64,
        crisis_type: String,
        sentiment_label: String,
        article_count: usize,
        new_article_count: usize,
        breaking_count: usize,
        top: Vec<TopArticleSummary>,
    },
    /// Urgent-only: the answer to an explicit chat/CLI command, e.g. a
    /// `status`/`portfolio`/`defcon` query or a mutator's accept/reject
    /// result. The chat transport is out of scope; we only specify that
    /// this event exists and always goes urgent per §4.9.
    CommandResponse {
        timestamp: DateTime<Utc>,
        verb: String,
        accepted: bool,
        detail: String,
    },
}

impl AlertEvent {
    /// Which channel(s) this event is routed to, per §4.9's fanout table.
    /// Several kinds are dual-routed: always logged to the silent audit
    /// trail, and *additionally* paged urgently when they cross a severity
    /// bar (an escalation, an approval gate, a hard-loss/crisis exit).
    pub fn channels(&self) -> Vec<Channel> {
        match self {
            AlertEvent::CycleSummary { .. } => vec![Channel::Silent],
            AlertEvent::DefconChange { from, to, .. } => {
                // Escalation = level *decreases* (5 is peacetime, 1 is crisis).
                if to < from {
                    vec![Channel::Silent, Channel::Urgent]
                } else {
                    vec![Channel::Silent]
                }
            }
            AlertEvent::TradeEntry { pending, .. } => {
                if *pending {
                    vec![Channel::Silent, Channel::Urgent]
                } else {
                    vec![Channel::Silent]
                }
            }
            AlertEvent::TradeExit { reason, .. } => {
                if reason == "stop_loss" || reason == "defcon_revert" {
                    vec![Channel::Silent, Channel::Urgent]
                } else {
                    vec![Channel::Silent]
                }
            }
            // Emission itself is already gated on novelty/breaking by the
            // caller (§4.3); once emitted it is always silent per §4.9 —
            // the table doesn't list news_update under urgent.
            AlertEvent::NewsUpdate { .. } => vec![Channel::Silent],
            AlertEvent::CommandResponse { .. } => vec![Channel::Urgent],
        }
    }

    fn event_name(&self) -> &'static str {
        match self {
            AlertEvent::CycleSummary { .. } => "cycle_summary",
            AlertEvent::DefconChange { .. } => "defcon_change",
            AlertEvent::TradeEntry { .. } => "trade_entry",
            AlertEvent::TradeExit { .. } => "trade_exit",
            AlertEvent::NewsUpdate { .. } => "news_update",
            AlertEvent::CommandResponse { .. } => "command_response",
        }
    }
}

/// Transport abstraction so the router stays ignorant of what carries an
/// alert (webhook, log sink, chat bot) — injected per §9's collaborator
/// convention.
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn send(&self, channel: Channel, event: &AlertEvent) -> anyhow::Result<()>;
}

/// A transport that only logs — the default when no endpoint is configured,
/// and what tests use.
pub struct LoggingTransport;

#[async_trait]
impl AlertTransport for LoggingTransport {
    async fn send(&self, channel: Channel, event: &AlertEvent) -> anyhow::Result<()> {
        tracing::info!(?channel, event = ?event, "alert");
        Ok(())
    }
}

/// Posts the event JSON to a per-channel webhook URL, when one is
/// configured; channels with no configured endpoint fall back to logging.
/// Grounded on the teacher's `reqwest::Client` usage in `scrapers/dome.rs` —
/// same "build once, POST JSON, swallow the error at the call site" shape.
pub struct WebhookTransport {
    client: reqwest::Client,
    urgent_endpoint: Option<String>,
    silent_endpoint: Option<String>,
}

impl WebhookTransport {
    pub fn new(cfg: &AlertsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            urgent_endpoint: cfg.urgent_endpoint.clone(),
            silent_endpoint: cfg.silent_endpoint.clone(),
        }
    }

    fn endpoint_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Urgent => self.urgent_endpoint.as_deref(),
            Channel::Silent => self.silent_endpoint.as_deref(),
        }
    }
}

#[async_trait]
impl AlertTransport for WebhookTransport {
    async fn send(&self, channel: Channel, event: &AlertEvent) -> anyhow::Result<()> {
        let Some(endpoint) = self.endpoint_for(channel) else {
            tracing::info!(?channel, event = ?event, "alert_logged_no_endpoint_configured");
            return Ok(());
        };
        self.client.post(endpoint).json(event).send().await?;
        Ok(())
    }
}

/// Per-channel count of transport send failures, for the §4.9 "transport
/// errors are counted, logged, and the event is dropped" contract.
pub struct AlertRouter {
    transport: Box<dyn AlertTransport>,
    silent_filter: Vec<String>,
    dropped: std::sync::atomic::AtomicU64,
}

impl AlertRouter {
    pub fn new(transport: Box<dyn AlertTransport>) -> Self {
        Self {
            transport,
            silent_filter: vec![],
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Build a router whose silent channel only accepts event kinds named in
    /// `alerts.silent.events` (empty = no filter, everything through).
    pub fn with_config(transport: Box<dyn AlertTransport>, cfg: &AlertsConfig) -> Self {
        Self {
            transport,
            silent_filter: cfg.silent_events.clone(),
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Route an event to every channel §4.9 assigns it to. Delivery failures
    /// are counted, logged, and swallowed — an alert never blocks or fails
    /// the orchestrator cycle (at-most-once delivery, no retry queue).
    pub async fn route(&self, event: AlertEvent) {
        for channel in event.channels() {
            if channel == Channel::Silent
                && !self.silent_filter.is_empty()
                && !self.silent_filter.iter().any(|e| e == event.event_name())
            {
                continue;
            }
            if let Err(e) = self.transport.send(channel, &event).await {
                self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(error = %e, ?channel, event = event.event_name(), "alert_delivery_failed");
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}
