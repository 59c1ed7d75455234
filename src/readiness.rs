//! Waiting for a target process to take over a session's pane.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::config::ReadinessSettings;
use crate::error::ErrorClass;
use crate::probe::PaneProbe;
use crate::tmux::MuxError;

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {}ms waiting for '{name}' to leave the shell (last command: {last_command})", waited.as_millis())]
    Timeout {
        name: String,
        waited: Duration,
        last_command: String,
    },
    #[error("session '{name}' died while waiting for it to become ready")]
    SessionDied { name: String },
    #[error("wait for '{name}' was cancelled")]
    Cancelled { name: String },
    #[error(transparent)]
    Mux(#[from] MuxError),
}

impl WaitError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WaitError::Timeout { .. } => ErrorClass::TransientContention,
            WaitError::SessionDied { .. } => ErrorClass::DeadResource,
            WaitError::Cancelled { .. } => ErrorClass::Cancelled,
            WaitError::Mux(e) => e.class(),
        }
    }
}

/// Polls a pane until its foreground command is no longer a shell.
#[derive(Clone)]
pub struct ReadinessWaiter {
    probe: PaneProbe,
    poll_interval: Duration,
}

impl ReadinessWaiter {
    pub fn new(probe: PaneProbe, settings: &ReadinessSettings) -> Self {
        Self {
            probe,
            poll_interval: Duration::from_millis(settings.poll_interval_millis.max(1)),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wait until the foreground command of `name` is not in `shells`.
    ///
    /// Only set membership is checked, so a launcher that shows up as a
    /// version string counts as ready. Returns the command that was seen.
    /// `stop` is checked before every query and during every sleep.
    pub fn wait_for_non_shell(
        &self,
        name: &str,
        shells: &[String],
        timeout: Duration,
        stop: &AtomicBool,
    ) -> Result<String, WaitError> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut last_command = String::new();

        loop {
            if stop.load(Ordering::SeqCst) {
                return Err(WaitError::Cancelled {
                    name: name.to_string(),
                });
            }

            if !self.probe.exists(name)? {
                return Err(WaitError::SessionDied {
                    name: name.to_string(),
                });
            }
            match self.probe.dead(name) {
                Ok(false) => {}
                Ok(true) => {
                    return Err(WaitError::SessionDied {
                        name: name.to_string(),
                    });
                }
                Err(e) if e.is_missing_session() => {
                    return Err(WaitError::SessionDied {
                        name: name.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }

            match self.probe.command(name) {
                Ok(command) => {
                    if !shells.iter().any(|s| *s == command) {
                        debug!(
                            session = name,
                            command = %command,
                            elapsed_ms = start.elapsed().as_millis() as u64,
                            "pane left the shell"
                        );
                        return Ok(command);
                    }
                    last_command = command;
                }
                Err(e) if e.is_missing_session() => {
                    return Err(WaitError::SessionDied {
                        name: name.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout {
                    name: name.to_string(),
                    waited: now - start,
                    last_command,
                });
            }
            let nap = self.poll_interval.min(deadline - now);
            if sleep_unless_stopped(nap, stop) {
                return Err(WaitError::Cancelled {
                    name: name.to_string(),
                });
            }
        }
    }
}

/// Sleep for `total` in short slices. Returns true if `stop` was raised.
pub(crate) fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(25);
    let end = Instant::now() + total;
    loop {
        if stop.load(Ordering::SeqCst) {
            return true;
        }
        let now = Instant::now();
        if now >= end {
            return false;
        }
        thread::sleep(SLICE.min(end - now));
    }
}
