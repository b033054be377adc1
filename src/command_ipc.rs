//! Filesystem command queue (C10): atomic create-then-rename drop-box with
//! in-flight quarantine and crash recovery.
//!
//! No direct teacher counterpart for the filesystem protocol itself; the
//! verb dispatch / exit-code convention mirrors the teacher's CLI subcommand
//! style in `main.rs` (`clap::Subcommand` match arms returning a process exit
//! code). Command files are JSON per §6: `{id, verb, args, received_at}`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// On-disk shape of a command file, exactly the §6 schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFile {
    pub id: String,
    pub verb: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl CommandFile {
    pub fn new(verb: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            verb: verb.into(),
            args,
            received_at: Utc::now(),
        }
    }
}

/// Parsed verbs a command file may carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Portfolio,
    Defcon,
    Hold,
    Resume,
    Yes,
    No,
    Refresh,
    Shutdown,
    EStop,
    Mode(String),
    Interval(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Accepted = 0,
    InvalidState = 2,
    UnknownVerb = 3,
}

impl Command {
    /// Parse a raw command-file body: deserialize the §6 JSON envelope, then
    /// map its `verb`/`args` onto a [`Command`]. A JSON parse failure and an
    /// unrecognized verb both surface as [`ExitCode::UnknownVerb`] — the
    /// caller (orchestrator) moves the offending file to `failed/` either
    /// way per §7's command-parse-error handling.
    pub fn parse(raw: &str) -> Result<Self, ExitCode> {
        let file: CommandFile = serde_json::from_str(raw).map_err(|_| ExitCode::UnknownVerb)?;
        Self::from_verb(&file.verb, &file.args)
    }

    /// Validate a verb/args pair without a JSON envelope — used by
    /// `hightradectl` to reject an unknown verb client-side before even
    /// writing a command file.
    pub fn from_verb_public(verb: &str, args: &[String]) -> Result<Self, ExitCode> {
        Self::from_verb(verb, args)
    }

    fn from_verb(verb: &str, args: &[String]) -> Result<Self, ExitCode> {
        match verb {
            "status" => Ok(Command::Status),
            "portfolio" => Ok(Command::Portfolio),
            "defcon" => Ok(Command::Defcon),
            "hold" => Ok(Command::Hold),
            "resume" => Ok(Command::Resume),
            "yes" => Ok(Command::Yes),
            "no" => Ok(Command::No),
            "refresh" => Ok(Command::Refresh),
            "shutdown" => Ok(Command::Shutdown),
            "estop" => Ok(Command::EStop),
            "mode" => args
                .first()
                .map(|m| Command::Mode(m.clone()))
                .ok_or(ExitCode::UnknownVerb),
            "interval" => args
                .first()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Command::Interval)
                .ok_or(ExitCode::UnknownVerb),
            _ => Err(ExitCode::UnknownVerb),
        }
    }
}

/// Manages the `pending/` and `in-flight/` subdirectories of a commands
/// directory. Writers (the `hightradectl` CLI, or an in-process chat
/// transport) drop files via [`submit`]; the orchestrator drains them via
/// [`claim_next`] / [`complete`].
pub struct CommandQueue {
    root: PathBuf,
    reclaim_after: chrono::Duration,
}

impl CommandQueue {
    pub fn new(root: impl Into<PathBuf>, reclaim_after_minutes: i64) -> Self {
        Self {
            root: root.into(),
            reclaim_after: chrono::Duration::minutes(reclaim_after_minutes),
        }
    }

    fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    fn in_flight_dir(&self) -> PathBuf {
        self.root.join("in-flight")
    }

    fn failed_dir(&self) -> PathBuf {
        self.root.join("failed")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(self.pending_dir())?;
        std::fs::create_dir_all(self.in_flight_dir())?;
        std::fs::create_dir_all(self.failed_dir())?;
        Ok(())
    }

    /// Atomically drop a command file: write to a tmp file in `pending/`,
    /// then rename into place. The rename is atomic on the same filesystem,
    /// so a reader never observes a partially-written file.
    pub fn submit(&self, command: &CommandFile) -> Result<PathBuf> {
        self.ensure_dirs()?;
        let body = serde_json::to_string(command).context("serializing command file")?;
        let name = format!("{}-{}.json", Utc::now().timestamp_nanos_opt().unwrap_or(0), command.id);
        let tmp_path = self.pending_dir().join(format!(".{name}.tmp"));
        let final_path = self.pending_dir().join(&name);
        std::fs::write(&tmp_path, body).context("writing command tmp file")?;
        std::fs::rename(&tmp_path, &final_path).context("renaming command into pending")?;
        Ok(final_path)
    }

    /// Move a command that failed to parse into `failed/`, recording the
    /// parse error alongside it. Per §7: a command parse error never affects
    /// the loop, it is just quarantined for inspection.
    pub fn fail(&self, path: &Path, body: &str, error: &str) -> Result<()> {
        self.ensure_dirs()?;
        let dest = self.failed_dir().join(path.file_name().unwrap());
        std::fs::write(&dest, body).context("writing failed command body")?;
        std::fs::write(dest.with_extension("error.txt"), error)
            .context("writing failed command error")?;
        if path.exists() {
            std::fs::remove_file(path).context("removing original failed command file")?;
        }
        Ok(())
    }

    /// Reclaim any in-flight file older than `reclaim_after` back into
    /// pending — recovers from a crash between claim and complete.
    pub fn reclaim_stale(&self) -> Result<()> {
        self.ensure_dirs()?;
        let cutoff = Utc::now() - self.reclaim_after;
        for entry in std::fs::read_dir(self.in_flight_dir())? {
            let entry = entry?;
            let path = entry.path();
            let modified = entry.metadata()?.modified()?;
            let modified: chrono::DateTime<Utc> = modified.into();
            if modified < cutoff {
                let dest = self.pending_dir().join(entry.file_name());
                if let Err(e) = std::fs::rename(&path, &dest) {
                    warn!(path = %path.display(), error = %e, "command_reclaim_failed");
                } else {
                    warn!(path = %dest.display(), "command_reclaimed_from_in_flight");
                }
            }
        }
        Ok(())
    }

    /// Claim the oldest pending command by renaming it into `in-flight/`.
    /// Returns its new path and contents, or `None` if the queue is empty.
    pub fn claim_next(&self) -> Result<Option<(PathBuf, String)>> {
        self.ensure_dirs()?;
        let mut entries: Vec<PathBuf> = std::fs::read_dir(self.pending_dir())?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| !n.starts_with('.'))
                    .unwrap_or(false)
            })
            .collect();
        entries.sort();

        let Some(path) = entries.into_iter().next() else {
            return Ok(None);
        };
        let dest = self.in_flight_dir().join(path.file_name().unwrap());
        std::fs::rename(&path, &dest)?;
        let body = std::fs::read_to_string(&dest)?;
        Ok(Some((dest, body)))
    }

    /// Remove a completed in-flight command file.
    pub fn complete(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).context("removing completed command file")
    }
}
