//! Per-source token accounting and exponential backoff (C1).
//!
//! Grounded on `scrapers/binance_session.rs::BackoffCalculator` (exponential
//! backoff with a cap, jitter) and `scrapers/dome.rs`'s retry-with-backoff
//! loop, generalized to the spec's per-source `{rpm_cap, min_interval_ms}`
//! token-bucket-ish acquire/record contract.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

const MAX_BACKOFF_SECS: i64 = 300;

/// Outcome of a single call, reported back via [`RateLimiter::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    RateLimited,
    OtherError,
}

#[derive(Debug, Clone)]
struct SourceState {
    rpm_cap: u32,
    min_interval_ms: u64,
    last_call_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    next_allowed_at: Option<DateTime<Utc>>,
    /// Timestamps of calls within the trailing one-minute window, oldest
    /// first, for the rolling rpm check.
    recent_calls: VecDeque<DateTime<Utc>>,
}

impl SourceState {
    fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            rpm_cap: cfg.rpm,
            min_interval_ms: cfg.min_ms,
            last_call_at: None,
            consecutive_failures: 0,
            next_allowed_at: None,
            recent_calls: VecDeque::new(),
        }
    }

    fn prune_window(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::seconds(60);
        while self
            .recent_calls
            .front()
            .map(|t| *t < cutoff)
            .unwrap_or(false)
        {
            self.recent_calls.pop_front();
        }
    }

    fn earliest_allowed(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut earliest = now;
        if let Some(last) = self.last_call_at {
            let min_next = last + chrono::Duration::milliseconds(self.min_interval_ms as i64);
            if min_next > earliest {
                earliest = min_next;
            }
        }
        if let Some(next) = self.next_allowed_at {
            if next > earliest {
                earliest = next;
            }
        }
        earliest
    }
}

/// Thread/task-safe per-source rate limiter. Backoff state is independent
/// per source; callers from distinct sources never block one another.
#[derive(Clone)]
pub struct RateLimiter {
    sources: std::sync::Arc<Mutex<HashMap<String, SourceState>>>,
    defaults: HashMap<String, RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(defaults: HashMap<String, RateLimitConfig>) -> Self {
        Self {
            sources: std::sync::Arc::new(Mutex::new(HashMap::new())),
            defaults,
        }
    }

    fn state_for<'a>(
        sources: &'a mut HashMap<String, SourceState>,
        defaults: &HashMap<String, RateLimitConfig>,
        source: &str,
    ) -> &'a mut SourceState {
        sources.entry(source.to_string()).or_insert_with(|| {
            let cfg = defaults.get(source).cloned().unwrap_or(RateLimitConfig {
                rpm: 60,
                min_ms: 1_000,
            });
            SourceState::new(&cfg)
        })
    }

    /// Blocks the caller (via async sleep) until the source is eligible: the
    /// minimum interval and any backoff window have elapsed, and the rolling
    /// one-minute window has fewer than `rpm_cap` calls so far. Updates
    /// `last_call_at` on return.
    pub async fn acquire(&self, source: &str) {
        loop {
            let wait = {
                let mut sources = self.sources.lock();
                let state = Self::state_for(&mut sources, &self.defaults, source);
                let now = Utc::now();
                state.prune_window(now);

                let earliest = state.earliest_allowed(now);
                if earliest > now {
                    Some(earliest - now)
                } else if state.recent_calls.len() as u32 >= state.rpm_cap {
                    // Oldest call ages out of the window; wait until then.
                    let oldest = *state.recent_calls.front().unwrap();
                    Some((oldest + chrono::Duration::seconds(60)) - now)
                } else {
                    state.last_call_at = Some(now);
                    state.recent_calls.push_back(now);
                    None
                }
            };

            match wait {
                None => return,
                Some(d) => {
                    let millis = d.num_milliseconds().max(1) as u64;
                    debug!(source, wait_ms = millis, "rate_limiter_wait");
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                }
            }
        }
    }

    /// Record the outcome of a completed call for backoff bookkeeping.
    pub fn record(&self, source: &str, outcome: CallOutcome) {
        let mut sources = self.sources.lock();
        let state = Self::state_for(&mut sources, &self.defaults, source);
        match outcome {
            CallOutcome::Ok => {
                state.consecutive_failures = 0;
            }
            CallOutcome::RateLimited => {
                state.consecutive_failures += 1;
                let backoff_secs =
                    2i64.saturating_pow(state.consecutive_failures.min(32)).min(MAX_BACKOFF_SECS);
                state.next_allowed_at = Some(Utc::now() + chrono::Duration::seconds(backoff_secs));
                warn!(
                    source,
                    consecutive_failures = state.consecutive_failures,
                    backoff_secs,
                    "rate_limited_backoff"
                );
            }
            CallOutcome::OtherError => {
                // No backoff change per §4.1.
            }
        }
    }

    /// Earliest time the next call to `source` would be permitted, for
    /// testing/inspection.
    pub fn next_allowed_at(&self, source: &str) -> Option<DateTime<Utc>> {
        self.sources.lock().get(source).and_then(|s| s.next_allowed_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        let mut defaults = HashMap::new();
        defaults.insert(
            "alpha_vantage_news".to_string(),
            RateLimitConfig {
                rpm: 5,
                min_ms: 12_000,
            },
        );
        RateLimiter::new(defaults)
    }

    #[test]
    fn backoff_after_three_429s_matches_boundary_scenario_6() {
        let rl = limiter();
        for k in 1..=3u32 {
            rl.record("alpha_vantage_news", CallOutcome::RateLimited);
            let expected = 2i64.pow(k).min(300);
            let next = rl.next_allowed_at("alpha_vantage_news").unwrap();
            let delta = (next - Utc::now()).num_seconds();
            // Allow small scheduling slack.
            assert!(
                (delta - expected).abs() <= 1,
                "k={k} expected {expected}s got {delta}s"
            );
        }
    }

    #[test]
    fn ok_outcome_resets_consecutive_failures() {
        let rl = limiter();
        rl.record("alpha_vantage_news", CallOutcome::RateLimited);
        rl.record("alpha_vantage_news", CallOutcome::RateLimited);
        rl.record("alpha_vantage_news", CallOutcome::Ok);
        let mut sources = rl.sources.lock();
        let state = RateLimiter::state_for(&mut sources, &rl.defaults, "alpha_vantage_news");
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn other_error_does_not_change_backoff() {
        let rl = limiter();
        rl.record("alpha_vantage_news", CallOutcome::OtherError);
        assert!(rl.next_allowed_at("alpha_vantage_news").is_none());
    }

    #[tokio::test]
    async fn acquire_does_not_block_on_first_call() {
        let rl = limiter();
        let start = std::time::Instant::now();
        rl.acquire("reddit").await;
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn backoff_delays_independently_per_source() {
        let rl = limiter();
        rl.record("alpha_vantage_news", CallOutcome::RateLimited);
        // A different source is unaffected.
        let start = std::time::Instant::now();
        rl.acquire("reddit").await;
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}
