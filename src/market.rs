//! Market data client (C4): quotes and macro indicators, with a synthetic
//! fallback when the upstream is unreachable.
//!
//! Grounded on `scrapers/dome.rs`'s reqwest-with-timeout client shape; the
//! synthetic-fallback path has no direct teacher counterpart and is built in
//! the same plain-`f64` style as `risk.rs`.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use tracing::warn;

use crate::config::Config;
use crate::models::MarketSnapshot;
use crate::rate_limiter::{CallOutcome, RateLimiter};

const RATE_LIMITER_KEY: &str = "market_data";

#[derive(Debug, Deserialize)]
struct MacroResponse {
    vix: f64,
    bond_yield_10y: f64,
    sp500_change_pct: f64,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    price: f64,
}

pub struct MarketClient {
    client: reqwest::Client,
    limiter: RateLimiter,
    last_known: parking_lot::Mutex<std::collections::BTreeMap<String, f64>>,
}

impl MarketClient {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            client: reqwest::Client::new(),
            limiter,
            last_known: parking_lot::Mutex::new(std::collections::BTreeMap::new()),
        }
    }

    /// Fetch one cycle's full snapshot: macro indicators plus a quote per
    /// tracked symbol. Any failure (timeout, transport error, malformed
    /// payload) degrades to a synthetic snapshot derived from the last known
    /// prices, marked `stale = true`.
    pub async fn snapshot(&self, cfg: &Config) -> MarketSnapshot {
        self.limiter.acquire(RATE_LIMITER_KEY).await;

        match self.fetch_live(cfg).await {
            Ok(snapshot) => {
                self.limiter.record(RATE_LIMITER_KEY, CallOutcome::Ok);
                let mut known = self.last_known.lock();
                for (symbol, price) in &snapshot.per_symbol_price {
                    known.insert(symbol.clone(), *price);
                }
                snapshot
            }
            Err(e) => {
                self.limiter.record(RATE_LIMITER_KEY, CallOutcome::OtherError);
                warn!(error = %e, "market_data_fetch_failed_using_synthetic");
                self.synthetic_snapshot(cfg)
            }
        }
    }

    async fn fetch_live(&self, cfg: &Config) -> anyhow::Result<MarketSnapshot> {
        let macro_resp: MacroResponse = tokio::time::timeout(
            Duration::from_secs(cfg.http_timeout_secs),
            self.client
                .get(format!("{}/macro", cfg.market_data_endpoint))
                .send(),
        )
        .await??
        .error_for_status()?
        .json()
        .await?;

        let mut per_symbol_price = std::collections::BTreeMap::new();
        for symbol in &cfg.market_symbols {
            let quote: QuoteResponse = tokio::time::timeout(
                Duration::from_secs(cfg.http_timeout_secs),
                self.client
                    .get(format!("{}/quote/{}", cfg.market_data_endpoint, symbol))
                    .send(),
            )
            .await??
            .error_for_status()?
            .json()
            .await?;
            per_symbol_price.insert(symbol.clone(), quote.price);
        }

        Ok(MarketSnapshot {
            timestamp: Utc::now(),
            vix: macro_resp.vix,
            bond_yield_10y: macro_resp.bond_yield_10y,
            sp500_change_pct: macro_resp.sp500_change_pct,
            per_symbol_price,
            stale: false,
        })
    }

    /// `last_known_price * uniform(0.98, 1.02)`, marked stale. Symbols never
    /// seen before default to a flat $100.
    fn synthetic_snapshot(&self, cfg: &Config) -> MarketSnapshot {
        let known = self.last_known.lock();
        let mut rng = rand::thread_rng();
        let mut per_symbol_price = std::collections::BTreeMap::new();
        for symbol in &cfg.market_symbols {
            let base = known.get(symbol).copied().unwrap_or(100.0);
            let jitter: f64 = rng.gen_range(0.98..=1.02);
            per_symbol_price.insert(symbol.clone(), base * jitter);
        }
        MarketSnapshot {
            timestamp: Utc::now(),
            vix: 20.0,
            bond_yield_10y: 3.5,
            sp500_change_pct: 0.0,
            per_symbol_price,
            stale: true,
        }
    }

    /// Single-symbol convenience accessor used by the exit evaluator outside
    /// the main cycle (e.g. manual `portfolio` command refresh).
    pub async fn quote(&self, cfg: &Config, symbol: &str) -> f64 {
        let snapshot = self.snapshot(cfg).await;
        snapshot
            .per_symbol_price
            .get(symbol)
            .copied()
            .unwrap_or(100.0)
    }
}
