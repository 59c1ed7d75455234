//! tmux adapter for warden.
//!
//! The [`Multiplexer`] trait is the only way the rest of the crate touches a
//! terminal multiplexer. [`Tmux`] implements it by shelling out to the tmux
//! CLI with every call bounded by a timeout; [`fake::FakeMux`] implements it
//! in memory for tests.
//!
//! All session-scoped targets use tmux's exact-match syntax (`=name`) so a
//! missing `worker-a` never resolves to a live `worker-ab` by prefix.

pub mod fake;

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{SessionSettings, TmuxSettings};
use crate::error::ErrorClass;
use crate::exec::{self, CommandOutput, ExecError};

/// Fragments of tmux stderr that mean the target does not exist.
const MISSING_TARGET_MARKERS: &[&str] = &[
    "can't find session",
    "can't find pane",
    "can't find window",
    "session not found",
    "no server running",
    "error connecting to",
    "no current target",
];

#[derive(Debug, Error)]
pub enum MuxError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("tmux session '{name}' not found")]
    NoSession { name: String },
    #[error("tmux {op} failed: {stderr}")]
    Command { op: &'static str, stderr: String },
}

impl MuxError {
    pub fn is_missing_session(&self) -> bool {
        matches!(self, MuxError::NoSession { .. })
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            MuxError::NoSession { .. } => ErrorClass::DeadResource,
            MuxError::Exec(ExecError::TimedOut { .. }) => ErrorClass::TransientContention,
            MuxError::Exec(_) | MuxError::Command { .. } => ErrorClass::Collaborator,
        }
    }
}

/// Process-exec boundary to a terminal multiplexer.
///
/// Every method is synchronous; a nonzero exit plus diagnostic text is the
/// error channel.
pub trait Multiplexer: Send + Sync {
    /// Create a detached session running `command` (empty = default shell).
    fn create_session(&self, name: &str, workdir: Option<&Path>, command: &str)
    -> Result<(), MuxError>;
    fn has_session(&self, name: &str) -> Result<bool, MuxError>;
    /// Capture up to `max_lines` of scrollback plus the visible pane.
    fn capture_pane(&self, name: &str, max_lines: usize) -> Result<String, MuxError>;
    /// Foreground command name of the session's active pane.
    fn pane_command(&self, name: &str) -> Result<String, MuxError>;
    /// Whether the active pane's process has exited (`remain-on-exit`).
    fn pane_dead(&self, name: &str) -> Result<bool, MuxError>;
    fn kill_session(&self, name: &str) -> Result<(), MuxError>;
    /// Type `text` literally into the pane.
    fn send_text(&self, name: &str, text: &str) -> Result<(), MuxError>;
    /// Send a single named key (`Enter`, `Escape`, `C-c`, ...).
    fn send_key(&self, name: &str, key: &str) -> Result<(), MuxError>;
    /// Deliver `text` as one paste event through a scratch buffer.
    fn paste_text(&self, name: &str, text: &str) -> Result<(), MuxError>;
    fn is_attached(&self, name: &str) -> Result<bool, MuxError>;
    fn in_copy_mode(&self, name: &str) -> Result<bool, MuxError>;
    fn exit_copy_mode(&self, name: &str) -> Result<(), MuxError>;
    /// Trigger a resize so processes blocked on the terminal get SIGWINCH.
    fn wake(&self, name: &str) -> Result<(), MuxError>;
    fn set_option(&self, name: &str, key: &str, value: &str) -> Result<(), MuxError>;
    fn show_option(&self, name: &str, key: &str) -> Result<Option<String>, MuxError>;
    /// Whether the pane lingers as a dead remnant after its process exits.
    fn set_remain_on_exit(&self, name: &str, on: bool) -> Result<(), MuxError>;
}

/// Exact-match session target.
fn session_target(name: &str) -> String {
    format!("={name}")
}

/// Exact-match target for the session's active pane.
fn pane_target(name: &str) -> String {
    format!("={name}:")
}

fn is_missing_target(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    MISSING_TARGET_MARKERS.iter().any(|m| lower.contains(m))
}

fn parse_flag(value: &str) -> bool {
    value.trim() == "1"
}

fn parse_attached(value: &str) -> bool {
    value.trim().parse::<u32>().map(|n| n > 0).unwrap_or(false)
}

/// tmux CLI implementation of [`Multiplexer`].
#[derive(Debug, Clone)]
pub struct Tmux {
    socket: Option<String>,
    timeout: Duration,
    width: u16,
    height: u16,
}

impl Default for Tmux {
    fn default() -> Self {
        Self {
            socket: None,
            timeout: Duration::from_secs(10),
            width: 220,
            height: 50,
        }
    }
}

impl Tmux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(tmux: &TmuxSettings, session: &SessionSettings) -> Self {
        Self {
            socket: tmux.socket.clone(),
            timeout: Duration::from_secs(tmux.command_timeout_secs),
            width: session.width,
            height: session.height,
        }
    }

    /// Talk to an isolated tmux server (`tmux -L <socket>`).
    pub fn with_socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("tmux");
        if let Some(socket) = &self.socket {
            cmd.args(["-L", socket.as_str()]);
        }
        cmd
    }

    fn exec(
        &self,
        op: &'static str,
        name: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, MuxError> {
        let mut cmd = self.command();
        cmd.args(args);
        let output = exec::run(cmd, stdin, self.timeout)?;
        if output.success() {
            return Ok(output);
        }

        let stderr = output.diagnostic();
        debug!(op, session = name, stderr = %stderr, "tmux command failed");
        if is_missing_target(&stderr) {
            return Err(MuxError::NoSession {
                name: name.to_string(),
            });
        }
        Err(MuxError::Command { op, stderr })
    }

    fn run(&self, op: &'static str, name: &str, args: &[&str]) -> Result<CommandOutput, MuxError> {
        self.exec(op, name, args, None)
    }

    fn display(&self, name: &str, format: &str) -> Result<String, MuxError> {
        let target = pane_target(name);
        let out = self.run(
            "display-message",
            name,
            &["display-message", "-p", "-t", target.as_str(), format],
        )?;
        Ok(out.stdout.trim().to_string())
    }

    /// `tmux -V`, used as an availability check.
    pub fn version(&self) -> Result<String, MuxError> {
        let out = self.run("-V", "", &["-V"])?;
        Ok(out.stdout.trim().to_string())
    }

    /// Kill the whole tmux server behind this socket (test teardown).
    pub fn kill_server(&self) -> Result<(), MuxError> {
        match self.run("kill-server", "", &["kill-server"]) {
            Ok(_) | Err(MuxError::NoSession { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Multiplexer for Tmux {
    fn create_session(
        &self,
        name: &str,
        workdir: Option<&Path>,
        command: &str,
    ) -> Result<(), MuxError> {
        let width = self.width.to_string();
        let height = self.height.to_string();
        let workdir_s = workdir.map(|p| p.to_string_lossy().to_string());

        let mut args = vec![
            "new-session",
            "-d",
            "-s",
            name,
            "-x",
            width.as_str(),
            "-y",
            height.as_str(),
        ];
        if let Some(dir) = workdir_s.as_deref() {
            args.extend(["-c", dir]);
        }
        if !command.is_empty() {
            args.push(command);
        }
        // Keep the pane around after its command exits so the startup check
        // can capture what it printed. Chained in the same invocation, the
        // option is set before the server reaps the child. Callers turn it
        // off again once startup is verified.
        let window = pane_target(name);
        args.extend([";", "set-option", "-w", "-t", window.as_str(), "remain-on-exit", "on"]);

        let out = self.exec("new-session", name, &args, None);
        match out {
            Ok(_) => {
                info!(session = name, "tmux session created");
                Ok(())
            }
            // new-session never targets an existing session, so a "not found"
            // style message here is a real failure, not a missing target.
            Err(MuxError::NoSession { .. }) => Err(MuxError::Command {
                op: "new-session",
                stderr: "tmux server unavailable".to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    fn has_session(&self, name: &str) -> Result<bool, MuxError> {
        let target = session_target(name);
        let mut cmd = self.command();
        cmd.args(["has-session", "-t", target.as_str()]);
        let out = exec::run(cmd, None, self.timeout)?;
        Ok(out.success())
    }

    fn capture_pane(&self, name: &str, max_lines: usize) -> Result<String, MuxError> {
        let target = pane_target(name);
        let start = format!("-{max_lines}");
        let out = self.run(
            "capture-pane",
            name,
            &["capture-pane", "-p", "-t", target.as_str(), "-S", start.as_str()],
        )?;
        Ok(out.stdout)
    }

    fn pane_command(&self, name: &str) -> Result<String, MuxError> {
        self.display(name, "#{pane_current_command}")
    }

    fn pane_dead(&self, name: &str) -> Result<bool, MuxError> {
        Ok(parse_flag(&self.display(name, "#{pane_dead}")?))
    }

    fn kill_session(&self, name: &str) -> Result<(), MuxError> {
        let target = session_target(name);
        self.run("kill-session", name, &["kill-session", "-t", target.as_str()])?;
        info!(session = name, "tmux session killed");
        Ok(())
    }

    fn send_text(&self, name: &str, text: &str) -> Result<(), MuxError> {
        let target = pane_target(name);
        // `-l` keeps punctuation from being parsed as key names.
        self.run(
            "send-keys",
            name,
            &["send-keys", "-t", target.as_str(), "-l", "--", text],
        )?;
        Ok(())
    }

    fn send_key(&self, name: &str, key: &str) -> Result<(), MuxError> {
        let target = pane_target(name);
        self.run("send-keys", name, &["send-keys", "-t", target.as_str(), key])?;
        Ok(())
    }

    fn paste_text(&self, name: &str, text: &str) -> Result<(), MuxError> {
        let buffer = format!("warden-{}", Uuid::new_v4().simple());
        self.exec(
            "load-buffer",
            name,
            &["load-buffer", "-b", buffer.as_str(), "-"],
            Some(text.as_bytes()),
        )?;

        let target = pane_target(name);
        // -d drops the buffer after pasting, -p wraps it in bracketed-paste
        // markers when the application asked for them.
        let pasted = self.run(
            "paste-buffer",
            name,
            &[
                "paste-buffer",
                "-d",
                "-p",
                "-b",
                buffer.as_str(),
                "-t",
                target.as_str(),
            ],
        );
        if pasted.is_err() {
            let _ = self.run("delete-buffer", name, &["delete-buffer", "-b", buffer.as_str()]);
        }
        pasted.map(|_| ())
    }

    fn is_attached(&self, name: &str) -> Result<bool, MuxError> {
        Ok(parse_attached(&self.display(name, "#{session_attached}")?))
    }

    fn in_copy_mode(&self, name: &str) -> Result<bool, MuxError> {
        Ok(parse_flag(&self.display(name, "#{pane_in_mode}")?))
    }

    fn exit_copy_mode(&self, name: &str) -> Result<(), MuxError> {
        let target = pane_target(name);
        self.run(
            "send-keys",
            name,
            &["send-keys", "-t", target.as_str(), "-X", "cancel"],
        )?;
        Ok(())
    }

    fn wake(&self, name: &str) -> Result<(), MuxError> {
        let size = self.display(name, "#{window_width} #{window_height}")?;
        let mut parts = size.split_whitespace();
        let width = parts.next().and_then(|w| w.parse::<u32>().ok());
        let height = parts.next().and_then(|h| h.parse::<u32>().ok());
        let (Some(width), Some(height)) = (width, height) else {
            return Err(MuxError::Command {
                op: "resize-window",
                stderr: format!("unparseable window size '{size}'"),
            });
        };

        let target = pane_target(name);
        let w = width.to_string();
        let shrunk = width.saturating_sub(1).max(1).to_string();
        let h = height.to_string();
        self.run(
            "resize-window",
            name,
            &["resize-window", "-t", target.as_str(), "-x", shrunk.as_str(), "-y", h.as_str()],
        )?;
        self.run(
            "resize-window",
            name,
            &["resize-window", "-t", target.as_str(), "-x", w.as_str(), "-y", h.as_str()],
        )?;
        // resize-window pins window-size to manual; hand sizing back to tmux
        // so a client attaching later gets its own dimensions.
        if let Err(e) = self.run(
            "set-option",
            name,
            &["set-option", "-w", "-u", "-t", target.as_str(), "window-size"],
        ) {
            debug!(session = name, error = %e, "failed to reset window-size");
        }
        debug!(session = name, "woke detached pane via resize");
        Ok(())
    }

    fn set_option(&self, name: &str, key: &str, value: &str) -> Result<(), MuxError> {
        let target = session_target(name);
        self.run(
            "set-option",
            name,
            &["set-option", "-t", target.as_str(), key, value],
        )?;
        Ok(())
    }

    fn show_option(&self, name: &str, key: &str) -> Result<Option<String>, MuxError> {
        let target = session_target(name);
        let out = self.run(
            "show-options",
            name,
            &["show-options", "-v", "-q", "-t", target.as_str(), key],
        )?;
        let value = out.stdout.trim().to_string();
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    fn set_remain_on_exit(&self, name: &str, on: bool) -> Result<(), MuxError> {
        let target = pane_target(name);
        let mut args = vec!["set-option", "-w"];
        if !on {
            args.push("-u");
        }
        args.extend(["-t", target.as_str(), "remain-on-exit"]);
        if on {
            args.push("on");
        }
        self.run("set-option", name, &args)?;
        debug!(session = name, on, "remain-on-exit updated");
        Ok(())
    }
}
