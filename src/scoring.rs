//! Signal scoring and DEFCON level mapping (C5).
//!
//! Grounded on `risk.rs::RiskManager::calculate_position` — a weighted sum of
//! normalized sub-signals mapped onto a small discrete scale. Same shape,
//! different sub-signals and a 5-level scale instead of a risk percentage.

use crate::config::DefconWeights;
use crate::models::{DefconLevel, MarketSnapshot, NewsSignal};

/// One weighted sub-signal, retained for `reason_code` attribution.
struct SubSignal {
    name: &'static str,
    value: f64,
    weight: f64,
}

impl SubSignal {
    fn contribution(&self) -> f64 {
        self.value * self.weight
    }
}

/// Composite 0-100 score plus the DEFCON level it maps to, and the
/// highest-contributing sub-signal's name for audit/alerting.
pub struct ScoringResult {
    pub score: f64,
    pub level: DefconLevel,
    pub reason_code: String,
}

pub fn score_cycle(
    news: &NewsSignal,
    market: &MarketSnapshot,
    weights: &DefconWeights,
) -> ScoringResult {
    let vix_component = ((market.vix - 15.0) / (40.0 - 15.0)).clamp(0.0, 1.0) * 100.0;
    let yield_component = ((market.bond_yield_10y - 3.5).abs() / 2.0).clamp(0.0, 1.0) * 100.0;
    let sp500_drawdown = (-market.sp500_change_pct / 3.0).clamp(0.0, 1.0) * 100.0;
    let breaking_bias = ((news.breaking_count as f64) * 20.0).min(100.0);
    let sentiment_skew = (news.sentiment_dist.bearish - news.sentiment_dist.bullish)
        .clamp(-1.0, 1.0)
        * 100.0;

    let signals = [
        SubSignal {
            name: "news_score",
            value: news.score,
            weight: weights.news_score,
        },
        SubSignal {
            name: "vix_component",
            value: vix_component,
            weight: weights.vix_component,
        },
        SubSignal {
            name: "yield_component",
            value: yield_component,
            weight: weights.yield_component,
        },
        SubSignal {
            name: "sp500_drawdown",
            value: sp500_drawdown,
            weight: weights.sp500_drawdown,
        },
        SubSignal {
            name: "breaking_bias",
            value: breaking_bias,
            weight: weights.breaking_bias,
        },
        SubSignal {
            name: "sentiment_skew",
            value: sentiment_skew,
            weight: weights.sentiment_skew,
        },
    ];

    let score: f64 = signals.iter().map(SubSignal::contribution).sum();
    let level = level_for_score(score);
    let reason_code = signals
        .iter()
        .max_by(|a, b| {
            a.contribution()
                .abs()
                .partial_cmp(&b.contribution().abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|s| s.name.to_string())
        .unwrap_or_else(|| "none".to_string());

    ScoringResult {
        score,
        level,
        reason_code,
    }
}

fn level_for_score(score: f64) -> DefconLevel {
    DefconLevel(if score >= 85.0 {
        1
    } else if score >= 70.0 {
        2
    } else if score >= 50.0 {
        3
    } else if score >= 30.0 {
        4
    } else {
        5
    })
}
