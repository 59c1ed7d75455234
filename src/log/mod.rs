//! Witness audit log: JSON lines, one event per line.
//!
//! The health loop records every tick, lifecycle request, cleanup step and
//! acknowledgment here so a teardown can be reconstructed after the fact.
//! Each line is a self-contained JSON object with an RFC 3339 timestamp.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// A structured event in the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    WitnessStarted {
        rig: String,
        pid: u32,
        foreground: bool,
    },
    WitnessStopped {
        rig: String,
        reason: String,
    },
    HealthCheck {
        total_checks: u64,
        today_checks: u64,
        monitored_workers: usize,
    },
    /// A shutdown request was recognised and handed to cleanup.
    LifecycleRequest {
        message_id: String,
        worker: String,
        from: String,
    },
    RequestUnparseable {
        message_id: String,
        subject: String,
        reason: String,
    },
    CleanupStep {
        worker: String,
        step: String,
        status: String,
    },
    CleanupFinished {
        worker: String,
        success: bool,
        error: Option<String>,
    },
    MessageAcked {
        message_id: String,
    },
    MailboxError {
        operation: String,
        error: String,
    },
}

/// Append-only writer for the audit log.
pub struct AuditLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl AuditLog {
    /// Open (or create) the log at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "audit log");

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
