//! Read-only pane queries.

use std::sync::Arc;

use serde::Serialize;

use crate::tmux::{Multiplexer, MuxError};

/// Point-in-time view of a session's active pane. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaneSnapshot {
    pub session: String,
    pub text: String,
    pub command: String,
    pub attached: bool,
    pub copy_mode: bool,
    pub dead: bool,
}

/// Query layer over a [`Multiplexer`]; it never mutates a pane.
#[derive(Clone)]
pub struct PaneProbe {
    mux: Arc<dyn Multiplexer>,
    capture_lines: usize,
}

impl PaneProbe {
    pub fn new(mux: Arc<dyn Multiplexer>, capture_lines: usize) -> Self {
        Self { mux, capture_lines }
    }

    pub fn exists(&self, name: &str) -> Result<bool, MuxError> {
        self.mux.has_session(name)
    }

    pub fn capture(&self, name: &str) -> Result<String, MuxError> {
        self.mux.capture_pane(name, self.capture_lines)
    }

    pub fn command(&self, name: &str) -> Result<String, MuxError> {
        self.mux.pane_command(name)
    }

    pub fn attached(&self, name: &str) -> Result<bool, MuxError> {
        self.mux.is_attached(name)
    }

    pub fn copy_mode(&self, name: &str) -> Result<bool, MuxError> {
        self.mux.in_copy_mode(name)
    }

    pub fn dead(&self, name: &str) -> Result<bool, MuxError> {
        self.mux.pane_dead(name)
    }

    /// Gather everything at once. `None` when the session is absent, including
    /// when it disappears between the individual queries.
    pub fn snapshot(&self, name: &str) -> Result<Option<PaneSnapshot>, MuxError> {
        if !self.exists(name)? {
            return Ok(None);
        }
        match self.collect(name) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) if e.is_missing_session() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn collect(&self, name: &str) -> Result<PaneSnapshot, MuxError> {
        Ok(PaneSnapshot {
            session: name.to_string(),
            command: self.command(name)?,
            dead: self.dead(name)?,
            attached: self.attached(name)?,
            copy_mode: self.copy_mode(name)?,
            text: self.capture(name)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::fake::FakeMux;

    fn probe() -> (Arc<FakeMux>, PaneProbe) {
        let mux = Arc::new(FakeMux::new());
        let probe = PaneProbe::new(mux.clone(), 10);
        (mux, probe)
    }

    #[test]
    fn snapshot_of_missing_session_is_none() {
        let (_mux, probe) = probe();
        assert_eq!(probe.snapshot("nope").unwrap(), None);
    }

    #[test]
    fn snapshot_collects_all_fields() {
        let (mux, probe) = probe();
        mux.add_session("s", "claude");
        mux.set_attached("s", true);
        mux.set_copy_mode("s", true);
        mux.set_output("s", "ready>");

        let snap = probe.snapshot("s").unwrap().unwrap();
        assert_eq!(snap.command, "claude");
        assert!(snap.attached);
        assert!(snap.copy_mode);
        assert!(!snap.dead);
        assert_eq!(snap.text, "ready>");
    }

    #[test]
    fn session_vanishing_mid_snapshot_is_none() {
        let (mux, probe) = probe();
        mux.add_session("s", "bash");
        mux.vanish_on("pane_dead");
        assert_eq!(probe.snapshot("s").unwrap(), None);
    }

    #[test]
    fn collaborator_failures_propagate() {
        let (mux, probe) = probe();
        mux.add_session("s", "bash");
        mux.fail_op("capture_pane");
        assert!(probe.snapshot("s").is_err());
    }
}
