use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hightrade::alerts::{AlertRouter, WebhookTransport};
use hightrade::config::Config;
use hightrade::market::MarketClient;
use hightrade::news::aggregator::NewsAggregator;
use hightrade::orchestrator::Orchestrator;
use hightrade::rate_limiter::RateLimiter;
use hightrade::store::Store;

#[derive(Parser, Debug)]
#[command(name = "hightrade", about = "Market-monitoring and paper-trading orchestrator")]
struct Args {
    /// Optional TOML file layered on top of environment-derived config.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut cfg = Config::from_env()?;
    if let Some(path) = &args.config {
        cfg = cfg.merge_toml_file(path)?;
    }

    info!(database_path = %cfg.database_path, cycle_interval_sec = cfg.cycle_interval_sec, "hightrade_starting");

    std::fs::write(&cfg.pid_file, format!("{}\n", std::process::id()))
        .unwrap_or_else(|e| tracing::warn!(pid_file = %cfg.pid_file, error = %e, "pid_file_write_failed"));

    let store = Store::open(&cfg.database_path).await?;
    let limiter = RateLimiter::new(cfg.rate_limits.clone());
    let news = NewsAggregator::new(limiter.clone());
    let market = MarketClient::new(limiter);
    let alerts = AlertRouter::with_config(Box::new(WebhookTransport::new(&cfg.alerts)), &cfg.alerts);

    let mut orchestrator = Orchestrator::new(cfg.clone(), store, news, market, alerts).await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::select! {
        result = orchestrator.run() => {
            result?;
        }
        _ = shutdown => {
            info!("hightrade_received_interrupt_shutting_down");
        }
    }

    let _ = std::fs::remove_file(&cfg.pid_file);
    Ok(())
}
