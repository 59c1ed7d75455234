//! Session lifecycle: create with startup verification, kill, classify.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SessionSettings;
use crate::error::ErrorClass;
use crate::probe::PaneProbe;
use crate::tmux::{Multiplexer, MuxError};

/// Session option recording the launch command, shown by `session status`.
pub const COMMAND_OPTION: &str = "@warden_command";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("working directory does not exist: {}", path.display())]
    MissingWorkdir { path: PathBuf },
    #[error("session '{name}' already exists")]
    Conflict { name: String },
    #[error("session '{name}' died during startup: {diagnostic}")]
    CreationFailed { name: String, diagnostic: String },
    #[error(transparent)]
    Mux(#[from] MuxError),
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::InvalidName { .. } | SessionError::MissingWorkdir { .. } => {
                ErrorClass::Validation
            }
            SessionError::Conflict { .. } => ErrorClass::Validation,
            SessionError::CreationFailed { .. } => ErrorClass::CreationFailure,
            SessionError::Mux(e) => e.class(),
        }
    }
}

/// Observed state of a session's pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// A shell is in the foreground; the target has not taken over (yet).
    ShellActive,
    /// Something other than a listed shell owns the pane.
    TargetActive,
    /// The session is gone or its pane process exited.
    Dead,
    /// A query failed; neither live nor dead can be claimed.
    Unknown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::ShellActive => "shell-active",
            SessionState::TargetActive => "target-active",
            SessionState::Dead => "dead",
            SessionState::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Reject names tmux would misparse as targets or that cannot be typed back.
pub fn validate_name(name: &str) -> Result<(), SessionError> {
    let invalid = |reason| {
        Err(SessionError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };
    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.contains('/') || name.contains('\\') {
        return invalid("contains a path separator");
    }
    if name.contains(':') {
        return invalid("contains ':'");
    }
    if name.contains('.') {
        return invalid("contains '.'");
    }
    if name.chars().any(char::is_whitespace) {
        return invalid("contains whitespace");
    }
    if name.chars().any(char::is_control) {
        return invalid("contains control characters");
    }
    Ok(())
}

/// `<prefix>-<rig>-<worker>`, with anything tmux-unsafe replaced by `-`.
pub fn worker_session_name(prefix: &str, rig: &str, worker: &str) -> String {
    let raw = format!("{prefix}-{rig}-{worker}");
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Whether the shell will replace itself with the target process.
pub fn replaces_shell(command: &str) -> bool {
    command.trim_start().starts_with("exec ")
}

/// Basename of the user's login shell (`$SHELL`), `sh` when unset.
pub fn default_shell_name() -> String {
    std::env::var("SHELL")
        .ok()
        .and_then(|s| {
            Path::new(&s)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "sh".to_string())
}

/// Creates, destroys and classifies sessions.
#[derive(Clone)]
pub struct SessionController {
    mux: Arc<dyn Multiplexer>,
    probe: PaneProbe,
    grace: Duration,
    shell: String,
}

impl SessionController {
    pub fn new(mux: Arc<dyn Multiplexer>, settings: &SessionSettings) -> Self {
        let probe = PaneProbe::new(Arc::clone(&mux), settings.capture_lines);
        Self {
            mux,
            probe,
            grace: settings.startup_grace(),
            shell: default_shell_name(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn probe(&self) -> &PaneProbe {
        &self.probe
    }

    /// Create `name` running `command` in `workdir` and verify it survived
    /// the startup grace window.
    ///
    /// A session that is already gone, or whose pane process exited, is a
    /// [`SessionError::CreationFailed`] carrying whatever the pane printed; the
    /// remnant is removed before returning.
    ///
    /// Only a live session under `name` is a [`SessionError::Conflict`]. A
    /// dead remnant left by an earlier worker is killed and replaced.
    pub fn create(
        &self,
        name: &str,
        workdir: Option<&Path>,
        command: &str,
    ) -> Result<(), SessionError> {
        validate_name(name)?;
        let workdir = workdir.filter(|p| !p.as_os_str().is_empty());
        if let Some(dir) = workdir
            && !dir.is_dir()
        {
            return Err(SessionError::MissingWorkdir {
                path: dir.to_path_buf(),
            });
        }

        if self.probe.exists(name)? {
            let dead = match self.probe.dead(name) {
                Ok(dead) => dead,
                Err(e) if e.is_missing_session() => true,
                Err(e) => return Err(e.into()),
            };
            if !dead {
                return Err(SessionError::Conflict {
                    name: name.to_string(),
                });
            }
            info!(session = name, "replacing dead session remnant");
            self.discard(name);
        }

        if let Err(e) = self.mux.create_session(name, workdir, command) {
            // Lost a race with another creator of the same name.
            if let MuxError::Command { stderr, .. } = &e
                && stderr.contains("duplicate session")
            {
                return Err(SessionError::Conflict {
                    name: name.to_string(),
                });
            }
            return Err(e.into());
        }

        thread::sleep(self.grace);
        self.verify_startup(name, command)?;

        // From here on an exit should take the session with it.
        if let Err(e) = self.mux.set_remain_on_exit(name, false) {
            warn!(session = name, error = %e, "failed to clear remain-on-exit");
        }

        if let Err(e) = self.mux.set_option(name, COMMAND_OPTION, command) {
            debug!(session = name, error = %e, "failed to record launch command");
        }
        info!(session = name, command, "session started");
        Ok(())
    }

    fn verify_startup(&self, name: &str, command: &str) -> Result<(), SessionError> {
        if !self.probe.exists(name)? {
            return Err(SessionError::CreationFailed {
                name: name.to_string(),
                diagnostic: "session exited before the startup check".to_string(),
            });
        }

        let dead = match self.probe.dead(name) {
            Ok(dead) => dead,
            Err(e) if e.is_missing_session() => true,
            Err(e) => return Err(e.into()),
        };
        if dead {
            let captured = self.probe.capture(name).unwrap_or_default();
            self.discard(name);
            let diagnostic = captured.trim();
            return Err(SessionError::CreationFailed {
                name: name.to_string(),
                diagnostic: if diagnostic.is_empty() {
                    "command exited during startup".to_string()
                } else {
                    diagnostic.to_string()
                },
            });
        }

        // Alive is the success criterion. Silence from a shell-wrapped
        // command only means it has not printed anything yet.
        if !replaces_shell(command)
            && let Ok(fg) = self.probe.command(name)
            && fg == self.shell
            && self.probe.capture(name).is_ok_and(|t| t.trim().is_empty())
        {
            debug!(session = name, "no output yet from shell-wrapped command");
        }
        Ok(())
    }

    fn discard(&self, name: &str) {
        match self.mux.kill_session(name) {
            Ok(()) => {}
            Err(e) if e.is_missing_session() => {}
            Err(e) => warn!(session = name, error = %e, "failed to remove dead session"),
        }
    }

    /// Kill `name`. Returns whether a session was actually removed; killing
    /// an absent session is not an error.
    pub fn kill(&self, name: &str) -> Result<bool, SessionError> {
        if !self.probe.exists(name)? {
            return Ok(false);
        }
        match self.mux.kill_session(name) {
            Ok(()) => Ok(true),
            Err(e) if e.is_missing_session() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, name: &str) -> Result<bool, SessionError> {
        Ok(self.probe.exists(name)?)
    }

    /// Classify the pane against `shells` by set membership of its
    /// foreground command name.
    pub fn classify(&self, name: &str, shells: &[String]) -> SessionState {
        let query = || -> Result<SessionState, MuxError> {
            if !self.probe.exists(name)? || self.probe.dead(name)? {
                return Ok(SessionState::Dead);
            }
            let command = self.probe.command(name)?;
            Ok(if shells.iter().any(|s| *s == command) {
                SessionState::ShellActive
            } else {
                SessionState::TargetActive
            })
        };
        match query() {
            Ok(state) => state,
            Err(e) if e.is_missing_session() => SessionState::Dead,
            Err(e) => {
                debug!(session = name, error = %e, "classification query failed");
                SessionState::Unknown
            }
        }
    }

    /// Launch command recorded at creation, if any.
    pub fn launch_command(&self, name: &str) -> Option<String> {
        self.mux.show_option(name, COMMAND_OPTION).ok().flatten()
    }
}
