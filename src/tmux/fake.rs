//! In-memory [`Multiplexer`] for tests.
//!
//! `FakeMux` keeps a table of sessions and models just enough of a terminal
//! to make delivery bugs visible: literal text containing `\n` submits a line
//! early (like real `send-keys`), pastes land as one unit, keys sent while in
//! copy mode or into a dead pane are swallowed, and `Enter`/`C-m` turns the
//! pending input into a submission. A pane whose process exits lingers as a
//! dead remnant only while `remain-on-exit` is on; otherwise the session is
//! reaped. Mutating calls are recorded in order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{MuxError, Multiplexer};

/// What a newly created session's command does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnBehavior {
    /// The pane stays up with `pane_command` in the foreground.
    Runs { pane_command: String },
    /// The command exits right away after printing `diagnostic`. With
    /// `remain_on_exit` the dead pane lingers; otherwise the session is gone.
    Exits {
        diagnostic: String,
        remain_on_exit: bool,
    },
}

/// A recorded mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxCall {
    Create { name: String, command: String },
    Kill { name: String },
    SendText { name: String, text: String },
    SendKey { name: String, key: String },
    Paste { name: String, text: String },
    ExitCopyMode { name: String },
    Wake { name: String },
    SetOption { name: String, key: String, value: String },
    RemainOnExit { name: String, on: bool },
}

impl MuxCall {
    pub fn session(&self) -> &str {
        match self {
            MuxCall::Create { name, .. }
            | MuxCall::Kill { name }
            | MuxCall::SendText { name, .. }
            | MuxCall::SendKey { name, .. }
            | MuxCall::Paste { name, .. }
            | MuxCall::ExitCopyMode { name }
            | MuxCall::Wake { name }
            | MuxCall::SetOption { name, .. }
            | MuxCall::RemainOnExit { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
struct FakeSession {
    workdir: Option<PathBuf>,
    pane_command: String,
    output: String,
    attached: bool,
    copy_mode: bool,
    dead: bool,
    remain_on_exit: bool,
    pending: String,
    submissions: Vec<String>,
    options: HashMap<String, String>,
    scheduled_command: Option<(Instant, String)>,
    scheduled_exit: Option<Instant>,
}

impl FakeSession {
    fn new(workdir: Option<PathBuf>, pane_command: String) -> Self {
        Self {
            workdir,
            pane_command,
            output: String::new(),
            attached: false,
            copy_mode: false,
            dead: false,
            remain_on_exit: false,
            pending: String::new(),
            submissions: Vec::new(),
            options: HashMap::new(),
            scheduled_command: None,
            scheduled_exit: None,
        }
    }

    /// Returns true when the process exited and nothing keeps the session.
    fn apply_schedule(&mut self) -> bool {
        let now = Instant::now();
        if self.scheduled_command.as_ref().is_some_and(|(at, _)| now >= *at) {
            if let Some((_, cmd)) = self.scheduled_command.take() {
                self.pane_command = cmd;
            }
        }
        if self.scheduled_exit.is_some_and(|at| now >= at) {
            self.scheduled_exit = None;
            self.dead = true;
            return !self.remain_on_exit;
        }
        false
    }

    fn accepts_input(&self) -> bool {
        !self.copy_mode && !self.dead
    }

    fn submit(&mut self) {
        let line = std::mem::take(&mut self.pending);
        self.submissions.push(line);
    }
}

#[derive(Debug, Default)]
struct FakeState {
    sessions: BTreeMap<String, FakeSession>,
    spawn_rules: Vec<(String, SpawnBehavior)>,
    default_pane_command: String,
    calls: Vec<MuxCall>,
    failing: HashSet<&'static str>,
    vanish_on: HashSet<&'static str>,
}

impl FakeState {
    fn reap(&mut self, name: &str) {
        if self
            .sessions
            .get_mut(name)
            .is_some_and(FakeSession::apply_schedule)
        {
            self.sessions.remove(name);
        }
    }
}

/// Scriptable in-memory multiplexer.
#[derive(Debug)]
pub struct FakeMux {
    state: Mutex<FakeState>,
}

impl Default for FakeMux {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMux {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                default_pane_command: "bash".to_string(),
                ..FakeState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Commands containing `pattern` behave as `behavior` when spawned.
    pub fn on_spawn(&self, pattern: &str, behavior: SpawnBehavior) {
        self.lock()
            .spawn_rules
            .push((pattern.to_string(), behavior));
    }

    /// Insert a live session directly, bypassing spawn rules. Like a worker
    /// past its startup check, it has `remain-on-exit` off.
    pub fn add_session(&self, name: &str, pane_command: &str) {
        self.lock().sessions.insert(
            name.to_string(),
            FakeSession::new(None, pane_command.to_string()),
        );
    }

    pub fn set_pane_command(&self, name: &str, command: &str) {
        if let Some(s) = self.lock().sessions.get_mut(name) {
            s.pane_command = command.to_string();
        }
    }

    /// Switch the foreground command once `after` has elapsed.
    pub fn schedule_pane_command(&self, name: &str, after: Duration, command: &str) {
        if let Some(s) = self.lock().sessions.get_mut(name) {
            s.scheduled_command = Some((Instant::now() + after, command.to_string()));
        }
    }

    /// End the pane's process once `after` has elapsed.
    pub fn schedule_exit(&self, name: &str, after: Duration) {
        if let Some(s) = self.lock().sessions.get_mut(name) {
            s.scheduled_exit = Some(Instant::now() + after);
        }
    }

    pub fn set_attached(&self, name: &str, attached: bool) {
        if let Some(s) = self.lock().sessions.get_mut(name) {
            s.attached = attached;
        }
    }

    pub fn set_copy_mode(&self, name: &str, on: bool) {
        if let Some(s) = self.lock().sessions.get_mut(name) {
            s.copy_mode = on;
        }
    }

    pub fn set_output(&self, name: &str, output: &str) {
        if let Some(s) = self.lock().sessions.get_mut(name) {
            s.output = output.to_string();
        }
    }

    /// Remove a session as if its process exited without `remain-on-exit`.
    pub fn remove_externally(&self, name: &str) {
        self.lock().sessions.remove(name);
    }

    /// Every later call to `op` fails with a collaborator error.
    pub fn fail_op(&self, op: &'static str) {
        self.lock().failing.insert(op);
    }

    /// The target session disappears the moment `op` is invoked.
    pub fn vanish_on(&self, op: &'static str) {
        self.lock().vanish_on.insert(op);
    }

    pub fn calls(&self) -> Vec<MuxCall> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, name: &str) -> Vec<MuxCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.session() == name)
            .cloned()
            .collect()
    }

    /// Inputs the receiving process has seen submitted, in order.
    pub fn submissions(&self, name: &str) -> Vec<String> {
        self.lock()
            .sessions
            .get(name)
            .map(|s| s.submissions.clone())
            .unwrap_or_default()
    }

    /// Text typed or pasted but not yet submitted.
    pub fn pending_input(&self, name: &str) -> String {
        self.lock()
            .sessions
            .get(name)
            .map(|s| s.pending.clone())
            .unwrap_or_default()
    }

    pub fn session_workdir(&self, name: &str) -> Option<PathBuf> {
        self.lock().sessions.get(name).and_then(|s| s.workdir.clone())
    }

    pub fn session_names(&self) -> Vec<String> {
        self.lock().sessions.keys().cloned().collect()
    }

    /// Common prologue: injected failures, vanishing, schedule, lookup.
    fn with_session<T>(
        &self,
        op: &'static str,
        name: &str,
        f: impl FnOnce(&mut FakeSession, &mut Vec<MuxCall>) -> T,
    ) -> Result<T, MuxError> {
        let mut state = self.lock();
        if state.failing.contains(op) {
            return Err(MuxError::Command {
                op,
                stderr: format!("injected {op} failure"),
            });
        }
        if state.vanish_on.contains(op) {
            state.sessions.remove(name);
        }
        state.reap(name);
        let FakeState {
            sessions, calls, ..
        } = &mut *state;
        let session = sessions.get_mut(name).ok_or_else(|| MuxError::NoSession {
            name: name.to_string(),
        })?;
        Ok(f(session, calls))
    }
}

impl Multiplexer for FakeMux {
    fn create_session(
        &self,
        name: &str,
        workdir: Option<&Path>,
        command: &str,
    ) -> Result<(), MuxError> {
        let mut state = self.lock();
        if state.failing.contains("create_session") {
            return Err(MuxError::Command {
                op: "new-session",
                stderr: "injected create_session failure".to_string(),
            });
        }
        if state.sessions.contains_key(name) {
            return Err(MuxError::Command {
                op: "new-session",
                stderr: format!("duplicate session: {name}"),
            });
        }
        state.calls.push(MuxCall::Create {
            name: name.to_string(),
            command: command.to_string(),
        });

        let behavior = state
            .spawn_rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, b)| b.clone())
            .unwrap_or_else(|| SpawnBehavior::Runs {
                pane_command: state.default_pane_command.clone(),
            });

        let workdir = workdir.map(Path::to_path_buf);
        match behavior {
            SpawnBehavior::Runs { pane_command } => {
                let mut session = FakeSession::new(workdir, pane_command);
                session.remain_on_exit = true;
                state.sessions.insert(name.to_string(), session);
            }
            SpawnBehavior::Exits {
                diagnostic,
                remain_on_exit,
            } => {
                if remain_on_exit {
                    let mut session = FakeSession::new(workdir, String::new());
                    session.output = diagnostic;
                    session.dead = true;
                    session.remain_on_exit = true;
                    state.sessions.insert(name.to_string(), session);
                }
            }
        }
        Ok(())
    }

    fn has_session(&self, name: &str) -> Result<bool, MuxError> {
        let mut state = self.lock();
        if state.failing.contains("has_session") {
            return Err(MuxError::Command {
                op: "has-session",
                stderr: "injected has_session failure".to_string(),
            });
        }
        state.reap(name);
        Ok(state.sessions.contains_key(name))
    }

    fn capture_pane(&self, name: &str, max_lines: usize) -> Result<String, MuxError> {
        self.with_session("capture_pane", name, |s, _| {
            let lines: Vec<&str> = s.output.lines().collect();
            let start = lines.len().saturating_sub(max_lines);
            lines[start..].join("\n")
        })
    }

    fn pane_command(&self, name: &str) -> Result<String, MuxError> {
        self.with_session("pane_command", name, |s, _| s.pane_command.clone())
    }

    fn pane_dead(&self, name: &str) -> Result<bool, MuxError> {
        self.with_session("pane_dead", name, |s, _| s.dead)
    }

    fn kill_session(&self, name: &str) -> Result<(), MuxError> {
        self.with_session("kill_session", name, |_, calls| {
            calls.push(MuxCall::Kill {
                name: name.to_string(),
            });
        })?;
        self.lock().sessions.remove(name);
        Ok(())
    }

    fn send_text(&self, name: &str, text: &str) -> Result<(), MuxError> {
        self.with_session("send_text", name, |s, calls| {
            calls.push(MuxCall::SendText {
                name: name.to_string(),
                text: text.to_string(),
            });
            if !s.accepts_input() {
                return;
            }
            for ch in text.chars() {
                if ch == '\n' {
                    s.submit();
                } else {
                    s.pending.push(ch);
                }
            }
        })
    }

    fn send_key(&self, name: &str, key: &str) -> Result<(), MuxError> {
        self.with_session("send_key", name, |s, calls| {
            calls.push(MuxCall::SendKey {
                name: name.to_string(),
                key: key.to_string(),
            });
            if !s.accepts_input() {
                return;
            }
            if matches!(key, "Enter" | "C-m") {
                s.submit();
            }
        })
    }

    fn paste_text(&self, name: &str, text: &str) -> Result<(), MuxError> {
        self.with_session("paste_text", name, |s, calls| {
            calls.push(MuxCall::Paste {
                name: name.to_string(),
                text: text.to_string(),
            });
            if s.accepts_input() {
                s.pending.push_str(text);
            }
        })
    }

    fn is_attached(&self, name: &str) -> Result<bool, MuxError> {
        self.with_session("is_attached", name, |s, _| s.attached)
    }

    fn in_copy_mode(&self, name: &str) -> Result<bool, MuxError> {
        self.with_session("in_copy_mode", name, |s, _| s.copy_mode)
    }

    fn exit_copy_mode(&self, name: &str) -> Result<(), MuxError> {
        self.with_session("exit_copy_mode", name, |s, calls| {
            calls.push(MuxCall::ExitCopyMode {
                name: name.to_string(),
            });
            s.copy_mode = false;
        })
    }

    fn wake(&self, name: &str) -> Result<(), MuxError> {
        self.with_session("wake", name, |_, calls| {
            calls.push(MuxCall::Wake {
                name: name.to_string(),
            });
        })
    }

    fn set_option(&self, name: &str, key: &str, value: &str) -> Result<(), MuxError> {
        self.with_session("set_option", name, |s, calls| {
            calls.push(MuxCall::SetOption {
                name: name.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            });
            s.options.insert(key.to_string(), value.to_string());
        })
    }

    fn show_option(&self, name: &str, key: &str) -> Result<Option<String>, MuxError> {
        self.with_session("show_option", name, |s, _| s.options.get(key).cloned())
    }

    fn set_remain_on_exit(&self, name: &str, on: bool) -> Result<(), MuxError> {
        self.with_session("set_remain_on_exit", name, |s, calls| {
            calls.push(MuxCall::RemainOnExit {
                name: name.to_string(),
                on,
            });
            s.remain_on_exit = on;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_newline_submits_early() {
        let mux = FakeMux::new();
        mux.add_session("s", "claude");
        mux.send_text("s", "a\nb").unwrap();
        mux.send_key("s", "Enter").unwrap();
        assert_eq!(mux.submissions("s"), vec!["a", "b"]);
    }

    #[test]
    fn paste_is_one_unit() {
        let mux = FakeMux::new();
        mux.add_session("s", "claude");
        mux.paste_text("s", "a\nb").unwrap();
        mux.send_key("s", "C-m").unwrap();
        assert_eq!(mux.submissions("s"), vec!["a\nb"]);
    }

    #[test]
    fn copy_mode_swallows_input() {
        let mux = FakeMux::new();
        mux.add_session("s", "claude");
        mux.set_copy_mode("s", true);
        mux.send_text("s", "lost").unwrap();
        mux.send_key("s", "Enter").unwrap();
        assert!(mux.submissions("s").is_empty());

        mux.exit_copy_mode("s").unwrap();
        mux.send_text("s", "kept").unwrap();
        mux.send_key("s", "Enter").unwrap();
        assert_eq!(mux.submissions("s"), vec!["kept"]);
    }

    #[test]
    fn spawn_rules_apply_by_substring() {
        let mux = FakeMux::new();
        mux.on_spawn(
            "/nonexistent",
            SpawnBehavior::Exits {
                diagnostic: "no such file".to_string(),
                remain_on_exit: false,
            },
        );
        mux.create_session("gone", None, "exec /nonexistent/bin").unwrap();
        assert!(!mux.has_session("gone").unwrap());

        mux.create_session("live", None, "").unwrap();
        assert_eq!(mux.pane_command("live").unwrap(), "bash");
    }

    #[test]
    fn scheduled_command_switches_after_delay() {
        let mux = FakeMux::new();
        mux.add_session("s", "bash");
        mux.schedule_pane_command("s", Duration::from_millis(30), "node");
        assert_eq!(mux.pane_command("s").unwrap(), "bash");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(mux.pane_command("s").unwrap(), "node");
    }

    #[test]
    fn injected_failures_and_vanishing() {
        let mux = FakeMux::new();
        mux.add_session("s", "bash");
        mux.fail_op("wake");
        assert!(matches!(
            mux.wake("s").unwrap_err(),
            MuxError::Command { .. }
        ));

        mux.vanish_on("paste_text");
        assert!(mux.paste_text("s", "x").unwrap_err().is_missing_session());
        assert!(!mux.has_session("s").unwrap());
    }

    #[test]
    fn exit_reaps_session_unless_remain_on_exit() {
        let mux = FakeMux::new();
        mux.add_session("plain", "node");
        mux.schedule_exit("plain", Duration::ZERO);
        assert!(!mux.has_session("plain").unwrap());

        mux.add_session("kept", "node");
        mux.set_remain_on_exit("kept", true).unwrap();
        mux.schedule_exit("kept", Duration::ZERO);
        assert!(mux.has_session("kept").unwrap());
        assert!(mux.pane_dead("kept").unwrap());
    }

    #[test]
    fn dead_pane_swallows_input() {
        let mux = FakeMux::new();
        mux.add_session("s", "node");
        mux.set_remain_on_exit("s", true).unwrap();
        mux.schedule_exit("s", Duration::ZERO);
        mux.send_text("s", "hello").unwrap();
        mux.paste_text("s", "world").unwrap();
        mux.send_key("s", "Enter").unwrap();
        assert!(mux.submissions("s").is_empty());
        assert_eq!(mux.pending_input("s"), "");
    }

    #[test]
    fn capture_is_bounded() {
        let mux = FakeMux::new();
        mux.add_session("s", "bash");
        mux.set_output("s", "1\n2\n3\n4");
        assert_eq!(mux.capture_pane("s", 2).unwrap(), "3\n4");
    }
}
