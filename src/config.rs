//! Enumerated configuration (§6). Loaded from environment (with `dotenv`
//! bootstrap, the teacher's `models::Config::from_env` convention) and
//! optionally overridden by a TOML file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub rpm: u32,
    pub min_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // Alpha-Vantage-style default.
        Self {
            rpm: 5,
            min_ms: 12_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub rate_limiter_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefconWeights {
    pub news_score: f64,
    pub vix_component: f64,
    pub yield_component: f64,
    pub sp500_drawdown: f64,
    pub breaking_bias: f64,
    /// Open-question extension point; inert (0.0) by default — see
    /// SPEC_FULL.md §9 Open Question #2.
    pub sentiment_skew: f64,
}

impl Default for DefconWeights {
    fn default() -> Self {
        Self {
            news_score: 0.40,
            vix_component: 0.20,
            yield_component: 0.15,
            sp500_drawdown: 0.15,
            breaking_bias: 0.10,
            sentiment_skew: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    pub profit_target: f64,
    pub stop_loss: f64,
    pub trailing_stop: f64,
    pub max_hold_hours: f64,
    pub min_hold_minutes: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            profit_target: 0.05,
            stop_loss: -0.03,
            trailing_stop: -0.02,
            max_hold_hours: 72.0,
            min_hold_minutes: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    /// Propose one entry per configured symbol the cycle the DEFCON level
    /// first degrades to this level or worse (lower = more severe) —
    /// symmetric with the `defcon_revert` exit (§4.6 priority 2), which
    /// closes such a position once the level later recovers to >= 3.
    pub defcon_trigger: u8,
    pub default_qty: f64,
    pub pending_expiry_minutes: i64,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            defcon_trigger: 2,
            default_qty: 10.0,
            pending_expiry_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub similarity_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    pub urgent_endpoint: Option<String>,
    pub silent_endpoint: Option<String>,
    /// Which event kinds are allowed onto the silent/audit channel. Empty
    /// means "no filter" — every event §4.9 assigns to silent goes through.
    pub silent_events: Vec<String>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            urgent_endpoint: None,
            silent_endpoint: None,
            silent_events: vec![],
        }
    }
}

/// A minimal, intentionally-undertuned default urgency/relevance lexicon —
/// the spec leaves the real lexicon out of scope (SPEC_FULL.md §9 Open
/// Question #3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lexicon {
    pub breaking_keywords: Vec<String>,
    pub high_keywords: Vec<String>,
    pub relevance_keywords: Vec<String>,
}

impl Default for Lexicon {
    fn default() -> Self {
        Self {
            breaking_keywords: vec![
                "crash".into(),
                "collapse".into(),
                "emergency".into(),
                "halt".into(),
                "plunge".into(),
                "default".into(),
            ],
            high_keywords: vec![
                "rate hike".into(),
                "inflation".into(),
                "recession".into(),
                "selloff".into(),
                "downgrade".into(),
                "contagion".into(),
            ],
            relevance_keywords: vec![
                "fed".into(),
                "market".into(),
                "stocks".into(),
                "bonds".into(),
                "yield".into(),
                "inflation".into(),
                "recession".into(),
                "bank".into(),
                "credit".into(),
                "geopolitical".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_path: String,
    pub commands_dir: String,
    pub pid_file: String,

    pub cycle_interval_sec: u64,
    pub broker_mode: String,

    pub dedup: DedupConfig,
    pub defcon_weights: DefconWeights,
    pub exit: ExitConfig,
    pub entry: EntryConfig,
    pub alerts: AlertsConfig,
    pub lexicon: Lexicon,

    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    pub news_sources: BTreeMap<String, SourceConfig>,

    pub market_data_endpoint: String,
    pub market_symbols: Vec<String>,

    pub ipc_poll_ms: u64,
    pub in_flight_reclaim_minutes: i64,
    pub http_timeout_secs: u64,

    /// Where a cycle's artifacts are logged when a persistence write fails
    /// twice in a row (§7: "availability over durability for this workload").
    pub spill_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut rate_limits = BTreeMap::new();
        rate_limits.insert("alpha_vantage_news".to_string(), RateLimitConfig::default());
        rate_limits.insert(
            "reddit".to_string(),
            RateLimitConfig {
                rpm: 60,
                min_ms: 1_000,
            },
        );
        rate_limits.insert(
            "market_data".to_string(),
            RateLimitConfig {
                rpm: 60,
                min_ms: 1_000,
            },
        );
        rate_limits.insert(
            "rss_feeds".to_string(),
            RateLimitConfig {
                rpm: 60,
                min_ms: 1_000,
            },
        );

        let mut news_sources = BTreeMap::new();
        news_sources.insert(
            "alpha_vantage_news".to_string(),
            SourceConfig {
                enabled: true,
                endpoint: "https://www.alphavantage.co/query".to_string(),
                api_key: None,
                rate_limiter_key: "alpha_vantage_news".to_string(),
            },
        );
        // Disabled by default — an operator enables and points this at a
        // real RSS endpoint via `sources.<name>.*` config keys.
        news_sources.insert(
            "rss_feeds.reuters_markets".to_string(),
            SourceConfig {
                enabled: false,
                endpoint: "https://www.reutersagency.com/feed/?best-topics=markets".to_string(),
                api_key: None,
                rate_limiter_key: "rss_feeds".to_string(),
            },
        );

        Self {
            database_path: "./hightrade.db".to_string(),
            commands_dir: "./commands".to_string(),
            pid_file: "./hightrade.pid".to_string(),
            cycle_interval_sec: 900,
            broker_mode: "disabled".to_string(),
            dedup: DedupConfig::default(),
            defcon_weights: DefconWeights::default(),
            exit: ExitConfig::default(),
            entry: EntryConfig::default(),
            alerts: AlertsConfig::default(),
            lexicon: Lexicon::default(),
            rate_limits,
            news_sources,
            market_data_endpoint: "https://example-quotes.invalid".to_string(),
            market_symbols: vec!["SPY".to_string()],
            ipc_poll_ms: 250,
            in_flight_reclaim_minutes: 5,
            http_timeout_secs: 5,
            spill_dir: "./spill".to_string(),
        }
    }
}

impl Config {
    /// Load from environment variables (`HIGHTRADE_*`), falling back to
    /// built-in defaults, after a best-effort `.env` load.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        let mut cfg = Self::default();

        cfg.database_path = env_or("HIGHTRADE_DATABASE_PATH", &cfg.database_path);
        cfg.commands_dir = env_or("HIGHTRADE_COMMANDS_DIR", &cfg.commands_dir);
        cfg.pid_file = env_or("HIGHTRADE_PID_FILE", &cfg.pid_file);
        cfg.cycle_interval_sec = env_parse("HIGHTRADE_CYCLE_INTERVAL_SEC", cfg.cycle_interval_sec);
        cfg.broker_mode = env_or("HIGHTRADE_BROKER_MODE", &cfg.broker_mode);
        cfg.dedup.similarity_threshold = env_parse(
            "HIGHTRADE_DEDUP_SIMILARITY_THRESHOLD",
            cfg.dedup.similarity_threshold,
        );
        cfg.entry.defcon_trigger = env_parse("HIGHTRADE_ENTRY_DEFCON_TRIGGER", cfg.entry.defcon_trigger);
        cfg.entry.default_qty = env_parse("HIGHTRADE_ENTRY_DEFAULT_QTY", cfg.entry.default_qty);
        cfg.entry.pending_expiry_minutes = env_parse(
            "HIGHTRADE_ENTRY_PENDING_EXPIRY_MINUTES",
            cfg.entry.pending_expiry_minutes,
        );

        if let Ok(raw) = std::env::var("HIGHTRADE_MARKET_SYMBOLS") {
            cfg.market_symbols = raw.split(',').map(|s| s.trim().to_string()).collect();
        }
        cfg.market_data_endpoint =
            env_or("HIGHTRADE_MARKET_DATA_ENDPOINT", &cfg.market_data_endpoint);
        cfg.spill_dir = env_or("HIGHTRADE_SPILL_DIR", &cfg.spill_dir);

        cfg.alerts.urgent_endpoint = std::env::var("HIGHTRADE_ALERTS_URGENT_ENDPOINT")
            .ok()
            .or(cfg.alerts.urgent_endpoint);
        cfg.alerts.silent_endpoint = std::env::var("HIGHTRADE_ALERTS_SILENT_ENDPOINT")
            .ok()
            .or(cfg.alerts.silent_endpoint);

        Ok(cfg)
    }

    /// Merge in overrides from a TOML file, if present. Every `§6` key is
    /// reachable this way as a sparse, nested TOML document — unknown keys
    /// are ignored (forward-compatible, mirroring the store's own migration
    /// policy of ignoring unknown columns).
    pub fn merge_toml_file(mut self, path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(self);
        }
        let raw = std::fs::read_to_string(path)?;
        let overrides: TomlOverrides = toml::from_str(&raw)?;

        if let Some(v) = overrides.cycle_interval_sec {
            self.cycle_interval_sec = v;
        }
        if let Some(v) = overrides.broker_mode {
            self.broker_mode = v;
        }
        if let Some(v) = overrides.database_path {
            self.database_path = v;
        }
        if let Some(v) = overrides.commands_dir {
            self.commands_dir = v;
        }
        if let Some(v) = overrides.pid_file {
            self.pid_file = v;
        }
        if let Some(v) = overrides.market_data_endpoint {
            self.market_data_endpoint = v;
        }
        if let Some(v) = overrides.market_symbols {
            self.market_symbols = v;
        }

        if let Some(d) = overrides.dedup {
            if let Some(v) = d.similarity_threshold {
                self.dedup.similarity_threshold = v;
            }
        }
        if let Some(e) = overrides.entry {
            if let Some(v) = e.defcon_trigger {
                self.entry.defcon_trigger = v;
            }
            if let Some(v) = e.default_qty {
                self.entry.default_qty = v;
            }
            if let Some(v) = e.pending_expiry_minutes {
                self.entry.pending_expiry_minutes = v;
            }
        }
        if let Some(x) = overrides.exit {
            if let Some(v) = x.profit_target {
                self.exit.profit_target = v;
            }
            if let Some(v) = x.stop_loss {
                self.exit.stop_loss = v;
            }
            if let Some(v) = x.trailing_stop {
                self.exit.trailing_stop = v;
            }
            if let Some(v) = x.max_hold_hours {
                self.exit.max_hold_hours = v;
            }
            if let Some(v) = x.min_hold_minutes {
                self.exit.min_hold_minutes = v;
            }
        }
        if let Some(w) = overrides.defcon_weights {
            if let Some(v) = w.news_score {
                self.defcon_weights.news_score = v;
            }
            if let Some(v) = w.vix_component {
                self.defcon_weights.vix_component = v;
            }
            if let Some(v) = w.yield_component {
                self.defcon_weights.yield_component = v;
            }
            if let Some(v) = w.sp500_drawdown {
                self.defcon_weights.sp500_drawdown = v;
            }
            if let Some(v) = w.breaking_bias {
                self.defcon_weights.breaking_bias = v;
            }
            if let Some(v) = w.sentiment_skew {
                self.defcon_weights.sentiment_skew = v;
            }
        }
        if let Some(a) = overrides.alerts {
            if let Some(v) = a.urgent_endpoint {
                self.alerts.urgent_endpoint = Some(v);
            }
            if let Some(v) = a.silent_endpoint {
                self.alerts.silent_endpoint = Some(v);
            }
            if let Some(v) = a.silent_events {
                self.alerts.silent_events = v;
            }
        }
        if let Some(limits) = overrides.rate_limits {
            for (key, limit) in limits {
                self.rate_limits.insert(key, limit);
            }
        }
        if let Some(sources) = overrides.news_sources {
            for (key, source) in sources {
                self.news_sources.insert(key, source);
            }
        }

        Ok(self)
    }
}

/// Sparse, all-optional mirror of the §6 config table a TOML file may
/// override. Nested tables mirror `Config`'s own field groupings so an
/// operator can write `[exit]` / `[defcon_weights]` / `[alerts]` sections
/// directly rather than a flat dotted key list.
#[derive(Debug, Default, Deserialize)]
struct TomlOverrides {
    cycle_interval_sec: Option<u64>,
    broker_mode: Option<String>,
    database_path: Option<String>,
    commands_dir: Option<String>,
    pid_file: Option<String>,
    market_data_endpoint: Option<String>,
    market_symbols: Option<Vec<String>>,

    dedup: Option<DedupOverrides>,
    entry: Option<EntryOverrides>,
    exit: Option<ExitOverrides>,
    defcon_weights: Option<DefconWeightsOverrides>,
    alerts: Option<AlertsOverrides>,

    rate_limits: Option<BTreeMap<String, RateLimitConfig>>,
    news_sources: Option<BTreeMap<String, SourceConfig>>,
}

#[derive(Debug, Default, Deserialize)]
struct DedupOverrides {
    similarity_threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct EntryOverrides {
    defcon_trigger: Option<u8>,
    default_qty: Option<f64>,
    pending_expiry_minutes: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ExitOverrides {
    profit_target: Option<f64>,
    stop_loss: Option<f64>,
    trailing_stop: Option<f64>,
    max_hold_hours: Option<f64>,
    min_hold_minutes: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct DefconWeightsOverrides {
    news_score: Option<f64>,
    vix_component: Option<f64>,
    yield_component: Option<f64>,
    sp500_drawdown: Option<f64>,
    breaking_bias: Option<f64>,
    sentiment_skew: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct AlertsOverrides {
    urgent_endpoint: Option<String>,
    silent_endpoint: Option<String>,
    silent_events: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = Config::default();
        let sum = cfg.defcon_weights.news_score
            + cfg.defcon_weights.vix_component
            + cfg.defcon_weights.yield_component
            + cfg.defcon_weights.sp500_drawdown
            + cfg.defcon_weights.breaking_bias;
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn merge_toml_file_ignores_missing_file() {
        let cfg = Config::default()
            .merge_toml_file(std::path::Path::new("/nonexistent/hightrade.toml"))
            .unwrap();
        assert_eq!(cfg.cycle_interval_sec, 900);
    }

    #[test]
    fn merge_toml_file_overrides_nested_tables_and_leaves_rest_at_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hightrade.toml");
        std::fs::write(
            &path,
            r#"
            cycle_interval_sec = 300

            [exit]
            stop_loss = -0.05

            [defcon_weights]
            sentiment_skew = 0.1

            [alerts]
            urgent_endpoint = "https://hooks.example/urgent"
            silent_events = ["cycle_summary"]

            [rate_limits.reddit]
            rpm = 30
            min_ms = 2000
            "#,
        )
        .unwrap();

        let cfg = Config::default().merge_toml_file(&path).unwrap();
        assert_eq!(cfg.cycle_interval_sec, 300);
        assert_eq!(cfg.exit.stop_loss, -0.05);
        assert_eq!(cfg.exit.profit_target, ExitConfig::default().profit_target);
        assert_eq!(cfg.defcon_weights.sentiment_skew, 0.1);
        assert_eq!(
            cfg.alerts.urgent_endpoint.as_deref(),
            Some("https://hooks.example/urgent")
        );
        assert_eq!(cfg.alerts.silent_events, vec!["cycle_summary".to_string()]);
        assert_eq!(cfg.rate_limits["reddit"].rpm, 30);
        assert_eq!(cfg.rate_limits["reddit"].min_ms, 2000);
        // untouched entries survive the merge
        assert_eq!(cfg.rate_limits["alpha_vantage_news"].rpm, 5);
    }
}
