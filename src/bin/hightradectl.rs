//! Companion CLI for the §6/§10 command surface: drops verbs into the
//! orchestrator's filesystem command queue (mutators) or reads current state
//! directly from the store (read-only `status`/`portfolio`/`defcon`).
//!
//! Grounded on the teacher's `bin/dataset_inspect.rs`: a `clap::Subcommand`
//! CLI that opens the same SQLite file the main process writes and prints
//! JSON, plus the teacher's general `main.rs` process-exit-code convention.

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;

use hightrade::command_ipc::{Command, CommandFile, CommandQueue};
use hightrade::config::Config;
use hightrade::store::Store;

#[derive(Parser, Debug)]
#[command(name = "hightradectl", about = "Interact with a running hightrade orchestrator")]
struct Cli {
    /// Optional TOML file layered on top of environment-derived config.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Verb,
}

#[derive(Subcommand, Debug)]
enum Verb {
    /// Current orchestrator mode, broker mode, cycle count (read-only, JSON).
    Status,
    /// Open positions (read-only, JSON).
    Portfolio,
    /// Current DEFCON level and signal score (read-only, JSON).
    Defcon,
    /// Pause new entry proposals; exits keep running.
    Hold,
    /// Resume from `held`.
    Resume,
    /// Approve the single pending entry decision.
    Yes,
    /// Reject the single pending entry decision.
    No,
    /// Interrupt the inter-cycle sleep and run a cycle now.
    Refresh,
    /// Drain the current cycle, then exit cleanly.
    Shutdown,
    /// Immediate stop: cancel in-flight I/O, freeze state.
    Estop,
    /// Change broker mode: `disabled`, `semi_auto`, or `full_auto`.
    Mode { value: String },
    /// Change the cycle interval, in minutes.
    Interval { minutes: u64 },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut cfg = Config::from_env()?;
    if let Some(path) = &cli.config {
        cfg = cfg.merge_toml_file(path)?;
    }

    match cli.command {
        Verb::Status => read_status(&cfg).await,
        Verb::Portfolio => read_portfolio(&cfg).await,
        Verb::Defcon => read_defcon(&cfg).await,
        other => submit(&cfg, other),
    }
}

async fn read_status(cfg: &Config) -> Result<ExitCode> {
    let store = Store::open(&cfg.database_path).await?;
    let state = store.load_orchestrator_state().await?.unwrap_or_default();
    println!(
        "{}",
        json!({
            "mode": format!("{:?}", state.mode),
            "broker_mode": format!("{:?}", state.broker_mode),
            "cycle_interval_sec": state.cycle_interval_sec,
            "cycle_count": state.cycle_count,
            "last_cycle_start": state.last_cycle_start,
        })
    );
    Ok(ExitCode::from(0))
}

async fn read_portfolio(cfg: &Config) -> Result<ExitCode> {
    let store = Store::open(&cfg.database_path).await?;
    let positions = store.load_positions().await?;
    let open: Vec<_> = positions
        .into_iter()
        .filter(|p| p.status != hightrade::models::PositionStatus::Closed)
        .map(|p| {
            json!({
                "id": p.id,
                "symbol": p.symbol,
                "qty": p.qty,
                "entry_price": p.entry_price,
                "current_price": p.current_price,
                "peak_price": p.peak_price,
                "pnl_pct": p.pnl_pct(p.current_price),
            })
        })
        .collect();
    println!("{}", json!({ "holdings": open }));
    Ok(ExitCode::from(0))
}

async fn read_defcon(cfg: &Config) -> Result<ExitCode> {
    let store = Store::open(&cfg.database_path).await?;
    let state = store.load_latest_defcon_state().await?;
    match state {
        Some(s) => {
            println!(
                "{}",
                json!({
                    "level": s.level.0,
                    "signal_score": s.signal_score,
                    "entered_at": s.entered_at,
                    "reason_code": s.reason_code,
                })
            );
        }
        None => println!("{}", json!({ "level": 5, "signal_score": 0.0, "reason_code": "none" })),
    }
    Ok(ExitCode::from(0))
}

/// Mutating verbs: drop a command file into `commands/pending/` using the
/// exact atomic create-then-rename protocol the orchestrator itself uses.
fn submit(cfg: &Config, verb: Verb) -> Result<ExitCode> {
    let (name, args) = match &verb {
        Verb::Hold => ("hold", vec![]),
        Verb::Resume => ("resume", vec![]),
        Verb::Yes => ("yes", vec![]),
        Verb::No => ("no", vec![]),
        Verb::Refresh => ("refresh", vec![]),
        Verb::Shutdown => ("shutdown", vec![]),
        Verb::Estop => ("estop", vec![]),
        Verb::Mode { value } => ("mode", vec![value.clone()]),
        Verb::Interval { minutes } => ("interval", vec![minutes.to_string()]),
        Verb::Status | Verb::Portfolio | Verb::Defcon => unreachable!("handled by read path"),
    };

    let file = CommandFile::new(name, args);
    // Validate client-side before writing, matching the exit-code contract:
    // an unknown verb/malformed args never even reach the queue.
    if Command::from_verb_public(&file.verb, &file.args).is_err() {
        eprintln!("unknown verb or missing argument: {name}");
        return Ok(ExitCode::from(3));
    }

    let queue = CommandQueue::new(cfg.commands_dir.clone(), cfg.in_flight_reclaim_minutes);
    queue.submit(&file)?;
    println!("submitted {name} (id={})", file.id);
    Ok(ExitCode::from(0))
}
