//! Multi-source fetch-and-merge into a single per-cycle [`NewsSignal`] (C3).
//!
//! Grounded on `scrapers/dome.rs`'s "one task per source, join, then reduce"
//! shape and `signals/db_storage.rs`'s cache-before-refetch pattern.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{Article, CrisisType, NewsSignal, SentimentDist, Urgency};
use crate::news::dedup;
use crate::news::sources::fetch_source;
use crate::rate_limiter::RateLimiter;

const CACHE_TTL: chrono::Duration = chrono::Duration::minutes(15);

struct CacheEntry {
    key: u64,
    cached_at: DateTime<Utc>,
    articles: Vec<Article>,
}

/// A 15-minute TTL cache keyed by the enabled-source set, so two cycles in
/// quick succession (e.g. after a manual `refresh`) don't refetch everything.
pub struct NewsCache {
    entry: parking_lot::Mutex<Option<CacheEntry>>,
}

impl NewsCache {
    pub fn new() -> Self {
        Self {
            entry: parking_lot::Mutex::new(None),
        }
    }

    fn lookup(&self, key: u64, now: DateTime<Utc>) -> Option<Vec<Article>> {
        let guard = self.entry.lock();
        let entry = guard.as_ref()?;
        if entry.key == key && now - entry.cached_at < CACHE_TTL {
            Some(entry.articles.clone())
        } else {
            None
        }
    }

    fn store(&self, key: u64, articles: Vec<Article>, now: DateTime<Utc>) {
        *self.entry.lock() = Some(CacheEntry {
            key,
            cached_at: now,
            articles,
        });
    }
}

impl Default for NewsCache {
    fn default() -> Self {
        Self::new()
    }
}

fn source_set_key(cfg: &Config) -> u64 {
    let mut names: Vec<&String> = cfg
        .news_sources
        .iter()
        .filter(|(_, s)| s.enabled)
        .map(|(name, _)| name)
        .collect();
    names.sort();
    let mut hasher = DefaultHasher::new();
    for name in names {
        name.hash(&mut hasher);
    }
    hasher.finish()
}

/// Fetches and merges all enabled news sources for one cycle.
pub struct NewsAggregator {
    client: reqwest::Client,
    limiter: RateLimiter,
    cache: NewsCache,
}

impl NewsAggregator {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            client: reqwest::Client::new(),
            limiter,
            cache: NewsCache::new(),
        }
    }

    /// Fetch every enabled source concurrently, merge, and deduplicate.
    /// Per-source failures are swallowed (logged) — a partial batch is
    /// always returned rather than failing the whole cycle.
    pub async fn fetch_cycle(&self, cfg: &Config) -> Vec<Article> {
        let now = Utc::now();
        let key = source_set_key(cfg);
        if let Some(cached) = self.cache.lookup(key, now) {
            info!("news_cache_hit");
            return cached;
        }

        let mut handles = Vec::new();
        for (name, source_cfg) in cfg.news_sources.iter() {
            if !source_cfg.enabled {
                continue;
            }
            let client = self.client.clone();
            let limiter = self.limiter.clone();
            let name = name.clone();
            let source_cfg = source_cfg.clone();
            let lexicon = cfg.lexicon.clone();
            let timeout_secs = cfg.http_timeout_secs;
            handles.push(tokio::spawn(async move {
                fetch_source(&client, &limiter, &name, &source_cfg, &lexicon, timeout_secs).await
            }));
        }

        let mut merged = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(outcome) => merged.extend(outcome.articles),
                Err(e) => warn!(error = %e, "news_source_task_panicked"),
            }
        }

        let deduped = dedup::dedupe(&merged, cfg.dedup.similarity_threshold);
        self.cache.store(key, deduped.clone(), now);
        deduped
    }
}

/// Build the cycle's [`NewsSignal`] summary from a deduplicated batch.
pub fn build_signal(cycle_id: i64, articles: &[Article]) -> NewsSignal {
    let breaking_count = articles
        .iter()
        .filter(|a| a.urgency == Urgency::Breaking)
        .count();

    let mut top: Vec<&Article> = articles.iter().collect();
    top.sort_by(|a, b| b.relevance.partial_cmp(&a.relevance).unwrap_or(std::cmp::Ordering::Equal));
    let top_articles = top.iter().take(5).map(|a| a.id.clone()).collect();

    let score = composite_news_score(articles);
    let crisis_type = dominant_crisis_type(articles);
    let sentiment_dist = SentimentDist::default();

    NewsSignal {
        cycle_id,
        timestamp: Utc::now(),
        article_count: articles.len(),
        score,
        crisis_type,
        sentiment_dist,
        top_articles,
        breaking_count,
    }
}

/// Weighted sum of relevance, scaled 0-100, biased upward by breaking-news
/// density — the raw input later fed into the composite DEFCON formula.
fn composite_news_score(articles: &[Article]) -> f64 {
    if articles.is_empty() {
        return 0.0;
    }
    let avg_relevance: f64 =
        articles.iter().map(|a| a.relevance).sum::<f64>() / articles.len() as f64;
    let breaking_ratio = articles
        .iter()
        .filter(|a| a.urgency == Urgency::Breaking)
        .count() as f64
        / articles.len() as f64;
    ((avg_relevance * 0.7 + breaking_ratio * 0.3) * 100.0).clamp(0.0, 100.0)
}

const CRISIS_KEYWORDS: &[(CrisisType, &[&str])] = &[
    (CrisisType::Systemic, &["systemic", "contagion", "bank run"]),
    (
        CrisisType::LiquidityCredit,
        &["credit", "liquidity", "default", "spread widening"],
    ),
    (
        CrisisType::InflationRate,
        &["inflation", "rate hike", "cpi", "federal reserve"],
    ),
    (
        CrisisType::MarketCorrection,
        &["correction", "selloff", "plunge", "crash"],
    ),
    (CrisisType::TechCrash, &["tech selloff", "nasdaq plunge"]),
    (
        CrisisType::Geopolitical,
        &["war", "sanctions", "invasion", "geopolitical"],
    ),
];

fn dominant_crisis_type(articles: &[Article]) -> CrisisType {
    let mut counts: HashMap<CrisisType, usize> = HashMap::new();
    for article in articles {
        let haystack =
            crate::models::normalize_text(&format!("{} {}", article.title, article.raw_text));
        for (crisis, keywords) in CRISIS_KEYWORDS {
            if keywords
                .iter()
                .any(|kw| haystack.contains(&crate::models::normalize_text(kw)))
            {
                *counts.entry(*crisis).or_insert(0) += 1;
            }
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(crisis, _)| crisis)
        .unwrap_or(CrisisType::None)
}

/// Decide whether this cycle's batch is "novel" enough to warrant acting on,
/// per the §4.3 novelty rule: any breaking article is unconditionally novel;
/// otherwise compare the new article-id set against the last persisted
/// signal's top articles. A failure to read the last signal fails safe to
/// novel=true (never silently suppress a cycle).
pub fn is_novel(articles: &[Article], last_top_article_ids: &[String], last_read_ok: bool) -> bool {
    if !last_read_ok {
        return true;
    }
    if articles.iter().any(|a| a.urgency == Urgency::Breaking) {
        return true;
    }
    let last: std::collections::HashSet<&str> =
        last_top_article_ids.iter().map(|s| s.as_str()).collect();
    articles.iter().any(|a| !last.contains(a.id.as_str()))
}
