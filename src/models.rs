//! The data model of §3: articles, per-cycle signals, market snapshots,
//! DEFCON state, paper positions, pending decisions, and orchestrator state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Urgency tier assigned to a news article by keyword match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Routine,
    High,
    Breaking,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Routine => "routine",
            Urgency::High => "high",
            Urgency::Breaking => "breaking",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "high" => Urgency::High,
            "breaking" => Urgency::Breaking,
            _ => Urgency::Routine,
        }
    }
}

/// An immutable ingested news article. Identity = `id`, a stable hash of the
/// normalized URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: String,
    pub source: String,
    pub title: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub raw_text: String,
    pub relevance: f64,
    pub urgency: Urgency,
}

impl Article {
    /// Stable id = sha256 of the normalized URL, hex-encoded.
    pub fn stable_id(url: &str) -> String {
        let normalized = normalize_url(url);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn new(
        source: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        published_at: DateTime<Utc>,
        raw_text: impl Into<String>,
    ) -> Self {
        let url = url.into();
        let id = Self::stable_id(&url);
        Self {
            id,
            source: source.into(),
            title: title.into(),
            url,
            published_at,
            fetched_at: Utc::now(),
            raw_text: raw_text.into(),
            relevance: 0.0,
            urgency: Urgency::Routine,
        }
    }

    /// Lowercase, punctuation-stripped, whitespace-collapsed title — used by
    /// phase-1 hash dedup.
    pub fn normalized_title(&self) -> String {
        normalize_text(&self.title)
    }

    pub fn normalized_url(&self) -> String {
        normalize_url(&self.url)
    }
}

/// Normalize a URL for hash-dedup comparison: trim, lowercase, strip a
/// trailing slash. Title normalization (punctuation/whitespace stripping)
/// is handled separately by `normalize_text`.
pub fn normalize_url(url: &str) -> String {
    let mut s = url.trim().to_lowercase();
    if let Some(stripped) = s.strip_suffix('/') {
        s = stripped.to_string();
    }
    s
}

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim().to_string()
}

/// Categorical label attached to a news signal, derived from keyword-family
/// dominance across retained articles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrisisType {
    None,
    MarketCorrection,
    InflationRate,
    LiquidityCredit,
    TechCrash,
    Geopolitical,
    Systemic,
}

impl CrisisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrisisType::None => "none",
            CrisisType::MarketCorrection => "market_correction",
            CrisisType::InflationRate => "inflation_rate",
            CrisisType::LiquidityCredit => "liquidity_credit",
            CrisisType::TechCrash => "tech_crash",
            CrisisType::Geopolitical => "geopolitical",
            CrisisType::Systemic => "systemic",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "market_correction" => CrisisType::MarketCorrection,
            "inflation_rate" => CrisisType::InflationRate,
            "liquidity_credit" => CrisisType::LiquidityCredit,
            "tech_crash" => CrisisType::TechCrash,
            "geopolitical" => CrisisType::Geopolitical,
            "systemic" => CrisisType::Systemic,
            _ => CrisisType::None,
        }
    }
}

/// Sentiment distribution; the three components always sum to 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SentimentDist {
    pub bearish: f64,
    pub bullish: f64,
    pub neutral: f64,
}

impl Default for SentimentDist {
    fn default() -> Self {
        Self {
            bearish: 0.0,
            bullish: 0.0,
            neutral: 1.0,
        }
    }
}

impl SentimentDist {
    /// Dominant label: ties resolve to `neutral`.
    pub fn label(&self) -> &'static str {
        if self.bearish > self.bullish && self.bearish > self.neutral {
            "bearish"
        } else if self.bullish > self.bearish && self.bullish > self.neutral {
            "bullish"
        } else {
            "neutral"
        }
    }
}

/// One row per cycle. Written once; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsSignal {
    pub cycle_id: i64,
    pub timestamp: DateTime<Utc>,
    pub article_count: usize,
    pub score: f64,
    pub crisis_type: CrisisType,
    pub sentiment_dist: SentimentDist,
    pub top_articles: Vec<String>,
    pub breaking_count: usize,
}

/// One per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub timestamp: DateTime<Utc>,
    pub vix: f64,
    pub bond_yield_10y: f64,
    pub sp500_change_pct: f64,
    pub per_symbol_price: std::collections::BTreeMap<String, f64>,
    pub stale: bool,
}

/// DEFCON level: 5 = peacetime, 1 = maximum crisis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DefconLevel(pub u8);

impl DefconLevel {
    pub fn peacetime() -> Self {
        DefconLevel(5)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefconState {
    pub level: DefconLevel,
    pub signal_score: f64,
    pub entered_at: DateTime<Utc>,
    pub reason_code: String,
}

/// Status of a paper position's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    PendingExit,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    ProfitTarget,
    TrailingStop,
    DefconRevert,
    TimeLimit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::ProfitTarget => "profit_target",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::DefconRevert => "defcon_revert",
            ExitReason::TimeLimit => "time_limit",
        }
    }

    /// Priority: higher wins when multiple strategies would fire in one tick.
    pub fn priority(&self) -> u8 {
        match self {
            ExitReason::StopLoss => 5,
            ExitReason::ProfitTarget => 4,
            ExitReason::TrailingStop => 3,
            ExitReason::DefconRevert => 2,
            ExitReason::TimeLimit => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_defcon: u8,
    pub peak_price: f64,
    pub current_price: f64,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
}

impl Position {
    pub fn pnl_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price
    }

    pub fn hold_time(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.entry_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Entry,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Awaiting,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDecision {
    pub id: String,
    pub kind: DecisionKind,
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: DecisionStatus,
}

/// Broker mode: governs how proposed trades cross the approval boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerMode {
    Disabled,
    SemiAuto,
    FullAuto,
}

impl BrokerMode {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "disabled" => Some(BrokerMode::Disabled),
            "semi_auto" => Some(BrokerMode::SemiAuto),
            "full_auto" => Some(BrokerMode::FullAuto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Running,
    Held,
    EStopped,
    ShuttingDown,
}

/// Lives in memory; restored from persistence at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub mode: RunMode,
    pub broker_mode: BrokerMode,
    pub cycle_interval_sec: u64,
    pub last_cycle_start: Option<DateTime<Utc>>,
    pub cycle_count: u64,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            mode: RunMode::Running,
            broker_mode: BrokerMode::Disabled,
            cycle_interval_sec: 900,
            last_cycle_start: None,
            cycle_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_url_strips_case_and_trailing_slash() {
        assert_eq!(
            normalize_url("HTTPS://Example.com/News/"),
            "https://example.com/news"
        );
    }

    #[test]
    fn normalize_text_collapses_punctuation_and_case() {
        assert_eq!(
            normalize_text("Fed Hikes Rates -- Again!!  (Breaking)"),
            "fed hikes rates again breaking"
        );
    }

    #[test]
    fn stable_id_is_deterministic_and_case_insensitive() {
        let a = Article::stable_id("https://example.com/a");
        let b = Article::stable_id("HTTPS://EXAMPLE.COM/a/");
        assert_eq!(a, b);
    }

    #[test]
    fn sentiment_label_ties_resolve_neutral() {
        let dist = SentimentDist {
            bearish: 0.4,
            bullish: 0.4,
            neutral: 0.2,
        };
        assert_eq!(dist.label(), "neutral");
    }
}
