//! Witness inbox: where lifecycle requests arrive.
//!
//! Two backends implement [`Mailbox`]: a local maildir under the control
//! directory, and an external mail command (e.g. `bd mail inbox --json`).
//! [`LifecycleRequest::from_message`] turns a message into a shutdown order.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use maildir::Maildir;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::ErrorClass;
use crate::exec::{self, ExecError};

/// Subject marker identifying lifecycle traffic.
pub const LIFECYCLE_MARKER: &str = "LIFECYCLE:";
/// Action keyword that requests teardown.
pub const SHUTDOWN_ACTION: &str = "shutdown";

/// Fallback pattern for the worker id in a free-form body.
static WORKER_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Worker:\s*(\S+)").unwrap());

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to store message: {0}")]
    Store(String),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("'{program}' failed: {stderr}")]
    Command { program: String, stderr: String },
    #[error("unreadable inbox listing: {0}")]
    Decode(#[from] serde_json::Error),
}

impl MailboxError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MailboxError::Exec(ExecError::TimedOut { .. }) => ErrorClass::TransientContention,
            _ => ErrorClass::Collaborator,
        }
    }
}

/// One unread message as the supervisor sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MailMessage {
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub from: String,
}

/// Mailbox collaborator.
pub trait Mailbox: Send + Sync {
    /// Unread messages, oldest first where the backend can tell.
    fn inbox(&self) -> Result<Vec<MailMessage>, MailboxError>;
    /// Remove `id` from the unread view.
    fn ack(&self, id: &str) -> Result<(), MailboxError>;
}

/// Parse an RFC 822-style message into headers we care about and a body.
fn parse_rfc822(id: &str, raw: &str) -> MailMessage {
    let raw = raw.replace("\r\n", "\n");
    let (head, body) = match raw.split_once("\n\n") {
        Some((h, b)) => (h, b),
        None => (raw.as_str(), ""),
    };

    // Unfold continuation lines before splitting into fields.
    let mut fields: Vec<String> = Vec::new();
    for line in head.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some(last) = fields.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
            }
        } else {
            fields.push(line.to_string());
        }
    }

    let mut msg = MailMessage {
        id: id.to_string(),
        body: body.trim_end().to_string(),
        ..MailMessage::default()
    };
    for field in &fields {
        let Some((key, value)) = field.split_once(':') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "subject" => msg.subject = value.trim().to_string(),
            "from" => msg.from = value.trim().to_string(),
            _ => {}
        }
    }
    msg
}

/// Maildir-backed inbox: unread is `new/`, ack moves to `cur/`.
pub struct MaildirMailbox {
    maildir: Maildir,
}

impl MaildirMailbox {
    /// Open (creating `new/`, `cur/`, `tmp/` if needed) the maildir at `path`.
    pub fn open(path: &Path) -> Result<Self, MailboxError> {
        let maildir = Maildir::from(path.to_path_buf());
        maildir.create_dirs().map_err(|source| MailboxError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { maildir })
    }

    pub fn path(&self) -> &Path {
        self.maildir.path()
    }

    /// Store a new unread message and return its id.
    pub fn deliver(&self, from: &str, subject: &str, body: &str) -> Result<String, MailboxError> {
        let date = chrono::Utc::now().to_rfc2822();
        let data = format!(
            "From: {from}\r\nTo: witness\r\nSubject: {subject}\r\nDate: {date}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n"
        );
        self.maildir
            .store_new(data.as_bytes())
            .map_err(|e| MailboxError::Store(e.to_string()))
    }

    /// Store a well-formed shutdown request for `worker`.
    pub fn request_shutdown(&self, from: &str, worker: &str) -> Result<String, MailboxError> {
        let subject = format!("{LIFECYCLE_MARKER} {SHUTDOWN_ACTION} {worker}");
        let body = format!("Worker: {worker}\n");
        self.deliver(from, &subject, &body)
    }
}

impl Mailbox for MaildirMailbox {
    fn inbox(&self) -> Result<Vec<MailMessage>, MailboxError> {
        let mut entries = Vec::new();
        for entry in self.maildir.list_new() {
            let entry = entry.map_err(|source| MailboxError::Io {
                path: self.maildir.path().join("new"),
                source,
            })?;
            let path = entry.path().to_path_buf();
            let raw = match fs::read(&path) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                // Acked or removed between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(MailboxError::Io { path, source }),
            };
            let modified = fs::metadata(&path).and_then(|m| m.modified()).ok();
            entries.push((modified, parse_rfc822(entry.id(), &raw)));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        Ok(entries.into_iter().map(|(_, m)| m).collect())
    }

    fn ack(&self, id: &str) -> Result<(), MailboxError> {
        self.maildir
            .move_new_to_cur(id)
            .map_err(|source| MailboxError::Io {
                path: self.maildir.path().join("new").join(id),
                source,
            })
    }
}

/// External mail tool, invoked once per inbox listing and once per ack.
pub struct CommandMailbox {
    program: String,
    inbox_args: Vec<String>,
    ack_args: Vec<String>,
    identity: String,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandMailbox {
    pub fn new(
        program: impl Into<String>,
        inbox_args: Vec<String>,
        ack_args: Vec<String>,
        identity: impl Into<String>,
        workdir: &Path,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            inbox_args,
            ack_args,
            identity: identity.into(),
            workdir: workdir.to_path_buf(),
            timeout,
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("WARDEN_AGENT_NAME", &self.identity);
        cmd
    }
}

impl Mailbox for CommandMailbox {
    fn inbox(&self) -> Result<Vec<MailMessage>, MailboxError> {
        let out = exec::run(self.command(&self.inbox_args), None, self.timeout)?;
        if !out.success() {
            if out.stderr.to_ascii_lowercase().contains("no messages") {
                return Ok(Vec::new());
            }
            return Err(MailboxError::Command {
                program: self.program.clone(),
                stderr: out.diagnostic(),
            });
        }
        let stdout = out.stdout.trim();
        if stdout.is_empty() || stdout == "[]" || stdout == "null" {
            return Ok(Vec::new());
        }
        let messages: Vec<MailMessage> = serde_json::from_str(stdout)?;
        debug!(count = messages.len(), program = %self.program, "inbox listed");
        Ok(messages)
    }

    fn ack(&self, id: &str) -> Result<(), MailboxError> {
        let mut args = self.ack_args.clone();
        args.push(id.to_string());
        let out = exec::run(self.command(&args), None, self.timeout)?;
        if out.success() {
            Ok(())
        } else {
            Err(MailboxError::Command {
                program: self.program.clone(),
                stderr: out.diagnostic(),
            })
        }
    }
}

/// Why a lifecycle message could not be turned into a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("no worker identifier in message body")]
    MissingWorker,
    #[error("invalid worker identifier '{0}'")]
    InvalidWorker(String),
}

/// A parsed shutdown instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleRequest {
    pub message_id: String,
    pub worker: String,
    pub from: String,
}

#[derive(Deserialize)]
struct StructuredBody {
    worker: String,
}

impl LifecycleRequest {
    /// Whether `subject` carries the lifecycle marker and the shutdown action.
    pub fn is_shutdown_subject(subject: &str) -> bool {
        subject.contains(LIFECYCLE_MARKER)
            && subject.to_ascii_lowercase().contains(SHUTDOWN_ACTION)
    }

    /// `Ok(None)` for messages that are not shutdown requests (left alone),
    /// `Err` for shutdown requests with no usable worker id (terminal).
    pub fn from_message(msg: &MailMessage) -> Result<Option<Self>, RequestError> {
        if !Self::is_shutdown_subject(&msg.subject) {
            return Ok(None);
        }
        let worker = extract_worker(&msg.body)?;
        Ok(Some(Self {
            message_id: msg.id.clone(),
            worker,
            from: msg.from.clone(),
        }))
    }
}

/// Structured `{"worker": ...}` body first, then the `Worker: <id>` token.
pub fn extract_worker(body: &str) -> Result<String, RequestError> {
    let candidate = serde_json::from_str::<StructuredBody>(body.trim())
        .map(|b| b.worker)
        .ok()
        .or_else(|| {
            WORKER_TOKEN
                .captures(body)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        })
        .ok_or(RequestError::MissingWorker)?;
    validate_worker(&candidate)?;
    Ok(candidate)
}

/// A worker id must be usable as a single path segment and branch suffix.
pub fn validate_worker(worker: &str) -> Result<(), RequestError> {
    let bad = worker.is_empty()
        || worker == "."
        || worker == ".."
        || worker.contains(['/', '\\'])
        || worker.chars().any(|c| c.is_whitespace() || c.is_control());
    if bad {
        Err(RequestError::InvalidWorker(worker.to_string()))
    } else {
        Ok(())
    }
}
