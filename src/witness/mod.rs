//! Witness: the per-rig health supervisor.
//!
//! The witness owns `.warden/witness.json`. While running it ticks on a fixed
//! interval; each tick records a health check and then drains the inbox,
//! tearing down every worker named in a shutdown request. A request is
//! acknowledged only after its cleanup succeeded, so failed cleanups are
//! retried on the next tick.
//!
//! Ownership is decided by the state file: the loop exits as soon as the
//! file no longer says "running with my pid", which lets `witness stop` from
//! another process win even if its signal is lost.

pub mod cleanup;
pub mod state;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ProjectConfig;
use crate::error::ErrorClass;
use crate::log::{AuditLog, LogEvent};
use crate::mailbox::{LifecycleRequest, MailMessage, Mailbox};
use crate::paths::ControlDir;
use crate::process;
use crate::readiness::sleep_unless_stopped;
use crate::session::SessionController;
use crate::tmux::Multiplexer;
use crate::worktree::Vcs;

pub use cleanup::{CleanupError, CleanupOutcome, CleanupSequence, CleanupStep, StepStatus};
pub use state::{RunState, StateError, StateLock, SupervisorState};

/// How long a background start waits for the child to claim ownership.
const CLAIM_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum WitnessError {
    #[error("witness is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },
    #[error("witness is not running")]
    NotRunning,
    #[error(transparent)]
    State(#[from] StateError),
    #[error("failed to start background witness (log: {}): {source}", log.display())]
    Spawn {
        log: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("background witness exited during startup ({status}); see {}", log.display())]
    ExitedEarly { log: PathBuf, status: String },
}

impl WitnessError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WitnessError::AlreadyRunning { .. } | WitnessError::NotRunning => {
                ErrorClass::Validation
            }
            WitnessError::State(_) | WitnessError::Spawn { .. } => ErrorClass::Collaborator,
            WitnessError::ExitedEarly { .. } => ErrorClass::CreationFailure,
        }
    }
}

/// Where the loop runs after `start`.
#[derive(Debug, Clone)]
pub enum StartMode {
    /// Run the loop on the calling thread until stopped.
    Foreground,
    /// Spawn `program args...` detached; it must end up calling
    /// [`Witness::run_owned`].
    Background { program: PathBuf, args: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The foreground loop ran and has now exited.
    Finished,
    /// A background witness is running with this pid; its output goes to `log`.
    Spawned { pid: u32, log: PathBuf },
}

/// Result of one inbox drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub seen: usize,
    /// Messages that were not lifecycle shutdown requests, left unread.
    pub ignored: usize,
    pub unparseable: usize,
    pub cleaned: Vec<String>,
    pub failed: Vec<String>,
    pub acked: usize,
}

pub struct Witness {
    paths: ControlDir,
    rig: String,
    interval: Duration,
    sessions: SessionController,
    mailbox: Arc<dyn Mailbox>,
    cleanup: CleanupSequence,
    audit: Option<AuditLog>,
    pid: u32,
}

impl Witness {
    pub fn new(
        config: &ProjectConfig,
        paths: ControlDir,
        mux: Arc<dyn Multiplexer>,
        vcs: Arc<dyn Vcs>,
        mailbox: Arc<dyn Mailbox>,
    ) -> Self {
        let rig = config.rig_name(paths.project_root());
        let sessions = SessionController::new(mux, &config.session);
        let cleanup = CleanupSequence::new(
            sessions.clone(),
            vcs,
            paths.clone(),
            &config.witness.session_prefix,
            &rig,
            &config.workspace.branch_prefix,
        );
        Self {
            paths,
            rig,
            interval: Duration::from_secs(config.witness.interval_secs.max(1)),
            sessions,
            mailbox,
            cleanup,
            audit: None,
            pid: std::process::id(),
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Act as process `pid` when claiming ownership of the state file.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn rig(&self) -> &str {
        &self.rig
    }

    pub fn sessions(&self) -> &SessionController {
        &self.sessions
    }

    fn audit(&self, event: LogEvent) {
        if let Some(audit) = &self.audit
            && let Err(e) = audit.log(event)
        {
            warn!(error = %e, "failed to write witness audit log");
        }
    }

    fn load(&self) -> Result<SupervisorState, StateError> {
        SupervisorState::load(&self.paths.state_file(), &self.rig)
    }

    fn save(&self, state: &SupervisorState) -> Result<(), StateError> {
        state.save(&self.paths.state_file())
    }

    fn lock_state(&self) -> Result<StateLock, StateError> {
        StateLock::acquire(&self.paths.state_file())
    }

    /// Worker directories under the workspace root, sorted.
    pub fn monitored_workers(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.paths.workspace_root()) else {
            return Vec::new();
        };
        let mut workers: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| !n.starts_with('.'))
            .collect();
        workers.sort();
        workers
    }

    /// Current state, reconciled against process liveness. A Running state
    /// whose pid is gone is rewritten as Stopped before returning.
    pub fn status(&self) -> Result<SupervisorState, WitnessError> {
        let workers = self.monitored_workers();
        let _lock = self.lock_state()?;
        let mut state = self.load()?;
        let mut dirty = false;

        if state.is_running() && !state.pid.is_some_and(process::is_alive) {
            info!(pid = ?state.pid, "witness process is gone, marking stopped");
            state.mark_stopped();
            dirty = true;
        }

        if workers != state.monitored_workers {
            state.monitored_workers = workers;
            dirty = true;
        }

        if dirty {
            self.save(&state)?;
        }
        Ok(state)
    }

    fn ensure_not_running(&self) -> Result<SupervisorState, WitnessError> {
        let state = self.load()?;
        if state.is_running()
            && let Some(pid) = state.pid
            && pid != self.pid
            && process::is_alive(pid)
        {
            return Err(WitnessError::AlreadyRunning { pid });
        }
        Ok(state)
    }

    /// Record this process as the running owner.
    fn claim(&self) -> Result<(), WitnessError> {
        let workers = self.monitored_workers();
        let _lock = self.lock_state()?;
        let mut state = self.ensure_not_running()?;
        state.rig_name = self.rig.clone();
        state.mark_running(self.pid, Utc::now());
        state.monitored_workers = workers;
        self.save(&state)?;
        Ok(())
    }

    pub fn start(&self, mode: StartMode, stop: &AtomicBool) -> Result<StartOutcome, WitnessError> {
        match mode {
            StartMode::Foreground => {
                self.run_owned(stop, true)?;
                Ok(StartOutcome::Finished)
            }
            StartMode::Background { program, args } => {
                self.ensure_not_running()?;
                self.spawn_background(&program, &args)
            }
        }
    }

    fn spawn_background(
        &self,
        program: &Path,
        args: &[String],
    ) -> Result<StartOutcome, WitnessError> {
        let log_dir = self.paths.logs_dir();
        let ts = Utc::now().format("%Y%m%dT%H%M%S");
        let log = log_dir.join(format!("witness-{ts}.log"));
        let spawn_err = |source| WitnessError::Spawn {
            log: log.clone(),
            source,
        };

        std::fs::create_dir_all(&log_dir).map_err(spawn_err)?;
        let stdout_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)
            .map_err(spawn_err)?;
        let stderr_log = stdout_log.try_clone().map_err(spawn_err)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(self.paths.project_root())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log));
        #[cfg(unix)]
        {
            // Own process group: Ctrl-C in the launching terminal must not reach it.
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd.spawn().map_err(spawn_err)?;
        let pid = child.id();

        // The child claims the state file itself; wait until it has.
        let deadline = Instant::now() + CLAIM_TIMEOUT;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(WitnessError::ExitedEarly {
                    log,
                    status: status.to_string(),
                });
            }
            if self.load().is_ok_and(|s| s.owned_by(pid)) {
                break;
            }
            if Instant::now() >= deadline {
                warn!(pid, "background witness has not claimed state yet, recording it");
                let _lock = self.lock_state()?;
                let mut state = self.load()?;
                if !state.owned_by(pid) {
                    state.mark_running(pid, Utc::now());
                    self.save(&state)?;
                }
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }

        info!(pid, log = %log.display(), "witness started in background");
        Ok(StartOutcome::Spawned { pid, log })
    }

    /// Claim ownership and run the loop until stopped or displaced.
    pub fn run_owned(&self, stop: &AtomicBool, foreground: bool) -> Result<(), WitnessError> {
        self.claim()?;
        info!(rig = %self.rig, pid = self.pid, foreground, "witness started");
        self.audit(LogEvent::WitnessStarted {
            rig: self.rig.clone(),
            pid: self.pid,
            foreground,
        });

        let reason = self.run_loop(stop);

        // Only clear the file if it is still ours.
        let cleared = self.lock_state().and_then(|_lock| {
            let mut state = self.load()?;
            if state.owned_by(self.pid) {
                state.mark_stopped();
                self.save(&state)?;
            }
            Ok(())
        });
        if let Err(e) = cleared {
            warn!(error = %e, "failed to record witness stop");
        }
        info!(rig = %self.rig, reason, "witness stopped");
        self.audit(LogEvent::WitnessStopped {
            rig: self.rig.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn run_loop(&self, stop: &AtomicBool) -> &'static str {
        loop {
            if stop.load(Ordering::SeqCst) {
                return "interrupted";
            }
            match self.load() {
                Ok(state) if state.owned_by(self.pid) => {
                    if !self.tick() {
                        return "state no longer owned";
                    }
                }
                Ok(_) => return "state no longer owned",
                Err(e) => warn!(error = %e, "failed to load witness state, skipping tick"),
            }
            if sleep_unless_stopped(self.interval, stop) {
                return "interrupted";
            }
        }
    }

    /// One pass of the loop. Returns false once another process has taken
    /// the state from us.
    fn tick(&self) -> bool {
        match self.health_check() {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => warn!(error = %e, "health check failed"),
        }
        let report = self.drain_inbox();
        if report.seen > 0 {
            debug!(?report, "inbox drained");
        }
        true
    }

    /// Record a check, unless the state stopped being ours since the loop
    /// last looked.
    fn health_check(&self) -> Result<bool, StateError> {
        let workers = self.monitored_workers();
        let _lock = self.lock_state()?;
        let mut state = self.load()?;
        if !state.owned_by(self.pid) {
            debug!("state changed hands, skipping health check");
            return Ok(false);
        }
        state.record_check(Utc::now());
        state.monitored_workers = workers;
        self.save(&state)?;
        debug!(
            total = state.stats.total_checks,
            today = state.stats.today_checks,
            workers = state.monitored_workers.len(),
            "health check"
        );
        self.audit(LogEvent::HealthCheck {
            total_checks: state.stats.total_checks,
            today_checks: state.stats.today_checks,
            monitored_workers: state.monitored_workers.len(),
        });
        Ok(true)
    }

    /// Persist Stopped, then signal the process that was running.
    pub fn stop(&self) -> Result<SupervisorState, WitnessError> {
        let (state, owner) = {
            let _lock = self.lock_state()?;
            let mut state = self.load()?;
            if !state.is_running() {
                return Err(WitnessError::NotRunning);
            }
            let owner = state.pid;
            state.mark_stopped();
            self.save(&state)?;
            (state, owner)
        };
        if let Some(pid) = owner
            && pid != self.pid
            && process::is_alive(pid)
            && let Err(e) = process::interrupt(pid)
        {
            warn!(pid, error = %e, "failed to signal witness process");
        }
        self.audit(LogEvent::WitnessStopped {
            rig: self.rig.clone(),
            reason: "stop requested".to_string(),
        });
        Ok(state)
    }

    /// Fetch unread mail and act on every shutdown request in it.
    pub fn drain_inbox(&self) -> DrainReport {
        let mut report = DrainReport::default();
        let messages = match self.mailbox.inbox() {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "failed to read witness inbox");
                self.audit(LogEvent::MailboxError {
                    operation: "inbox".to_string(),
                    error: e.to_string(),
                });
                return report;
            }
        };
        report.seen = messages.len();

        for msg in &messages {
            self.handle_message(msg, &mut report);
        }
        report
    }

    fn handle_message(&self, msg: &MailMessage, report: &mut DrainReport) {
        let request = match LifecycleRequest::from_message(msg) {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(id = %msg.id, subject = %msg.subject, "not a shutdown request, leaving unread");
                report.ignored += 1;
                return;
            }
            Err(e) => {
                warn!(id = %msg.id, subject = %msg.subject, error = %e, "unparseable shutdown request, discarding");
                report.unparseable += 1;
                self.audit(LogEvent::RequestUnparseable {
                    message_id: msg.id.clone(),
                    subject: msg.subject.clone(),
                    reason: e.to_string(),
                });
                self.ack(&msg.id, report);
                return;
            }
        };

        info!(worker = %request.worker, from = %request.from, "shutdown requested");
        self.audit(LogEvent::LifecycleRequest {
            message_id: request.message_id.clone(),
            worker: request.worker.clone(),
            from: request.from.clone(),
        });

        match self.cleanup_worker(&request.worker) {
            Ok(_) => {
                report.cleaned.push(request.worker.clone());
                self.ack(&request.message_id, report);
            }
            Err(e) => {
                warn!(worker = %request.worker, error = %e, "cleanup failed, request will be retried");
                report.failed.push(request.worker.clone());
            }
        }
    }

    fn ack(&self, id: &str, report: &mut DrainReport) {
        match self.mailbox.ack(id) {
            Ok(()) => {
                report.acked += 1;
                self.audit(LogEvent::MessageAcked {
                    message_id: id.to_string(),
                });
            }
            Err(e) => {
                warn!(id, error = %e, "failed to acknowledge message");
                self.audit(LogEvent::MailboxError {
                    operation: "ack".to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Run the teardown sequence for `worker`, recording each step.
    pub fn cleanup_worker(&self, worker: &str) -> Result<CleanupOutcome, CleanupError> {
        let result = self.cleanup.run(worker);
        let outcome = match &result {
            Ok(outcome) => Some(outcome),
            Err(CleanupError::Partial(p)) => Some(&p.outcome),
            Err(CleanupError::InvalidWorker(_)) => None,
        };
        if let Some(outcome) = outcome {
            for (step, status) in outcome.steps() {
                self.audit(LogEvent::CleanupStep {
                    worker: worker.to_string(),
                    step: step.to_string(),
                    status: status.label(),
                });
            }
        }
        self.audit(LogEvent::CleanupFinished {
            worker: worker.to_string(),
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::mailbox::{MailboxError, MaildirMailbox};
    use crate::tmux::fake::FakeMux;
    use crate::worktree::{Removal, VcsError};
    use std::sync::Mutex;

    struct DirVcs {
        fail: bool,
    }

    impl Vcs for DirVcs {
        fn remove_worktree(&self, _repo: &Path, path: &Path) -> Result<Removal, VcsError> {
            if self.fail {
                return Err(VcsError::Command {
                    op: "worktree remove",
                    stderr: "worktree is locked".to_string(),
                });
            }
            if !path.exists() {
                return Ok(Removal::Absent);
            }
            std::fs::remove_dir_all(path).map_err(|source| VcsError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Removal::Removed)
        }

        fn delete_branch(&self, _repo: &Path, _branch: &str) -> Result<Removal, VcsError> {
            Ok(Removal::Absent)
        }
    }

    /// In-memory mailbox recording acks.
    #[derive(Default)]
    struct MemMailbox {
        messages: Mutex<Vec<MailMessage>>,
        acked: Mutex<Vec<String>>,
    }

    impl Mailbox for MemMailbox {
        fn inbox(&self) -> Result<Vec<MailMessage>, MailboxError> {
            Ok(self.messages.lock().unwrap().clone())
        }

        fn ack(&self, id: &str) -> Result<(), MailboxError> {
            self.messages.lock().unwrap().retain(|m| m.id != id);
            self.acked.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    fn mail(id: &str, subject: &str, body: &str) -> MailMessage {
        MailMessage {
            id: id.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            from: "mayor".to_string(),
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        mux: Arc<FakeMux>,
        mailbox: Arc<MemMailbox>,
        witness: Witness,
        paths: ControlDir,
    }

    fn fixture(fail_vcs: bool) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = ProjectConfig::default();
        config.witness.rig = Some("rig".to_string());
        config.session.startup_grace_millis = 0;
        let paths = ControlDir::new(tmp.path(), &config.workspace);
        let mux = Arc::new(FakeMux::new());
        let mailbox = Arc::new(MemMailbox::default());
        let audit = AuditLog::open(&paths.audit_log()).unwrap();
        let witness = Witness::new(
            &config,
            paths.clone(),
            mux.clone(),
            Arc::new(DirVcs { fail: fail_vcs }),
            mailbox.clone(),
        )
        .with_audit(audit)
        .with_interval(Duration::from_millis(20));
        Fixture {
            _tmp: tmp,
            mux,
            mailbox,
            witness,
            paths,
        }
    }

    /// Pid of a process that has exited.
    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn status_without_file_is_stopped() {
        let f = fixture(false);
        let state = f.witness.status().unwrap();
        assert_eq!(state.state, RunState::Stopped);
        assert_eq!(state.rig_name, "rig");
    }

    #[test]
    fn status_reconciles_dead_pid() {
        let f = fixture(false);
        let mut state = SupervisorState::new("rig");
        state.mark_running(dead_pid(), Utc::now());
        state.save(&f.paths.state_file()).unwrap();

        let state = f.witness.status().unwrap();
        assert_eq!(state.state, RunState::Stopped);
        let reread = SupervisorState::load(&f.paths.state_file(), "rig").unwrap();
        assert_eq!(reread.state, RunState::Stopped);
        assert!(reread.pid.is_none());
    }

    #[test]
    fn status_keeps_live_owner_and_lists_workers() {
        let f = fixture(false);
        std::fs::create_dir_all(f.paths.workspace("bravo")).unwrap();
        std::fs::create_dir_all(f.paths.workspace("alpha")).unwrap();
        let mut state = SupervisorState::new("rig");
        state.mark_running(std::process::id(), Utc::now());
        state.save(&f.paths.state_file()).unwrap();

        let state = f.witness.status().unwrap();
        assert!(state.is_running());
        assert_eq!(state.monitored_workers, vec!["alpha", "bravo"]);
    }

    #[test]
    fn start_refuses_when_live_owner_exists() {
        let f = fixture(false);
        let other = Command::new("sleep").arg("30").spawn().unwrap();
        let mut state = SupervisorState::new("rig");
        state.mark_running(other.id(), Utc::now());
        state.save(&f.paths.state_file()).unwrap();

        let stop = AtomicBool::new(false);
        let err = f.witness.start(StartMode::Foreground, &stop).unwrap_err();
        assert!(matches!(err, WitnessError::AlreadyRunning { pid } if pid == other.id()));

        let mut other = other;
        let _ = other.kill();
        let _ = other.wait();
    }

    #[test]
    fn start_over_stale_state_succeeds() {
        let f = fixture(false);
        let mut state = SupervisorState::new("rig");
        state.mark_running(dead_pid(), Utc::now());
        state.save(&f.paths.state_file()).unwrap();

        // Pre-set stop: claim, one pass through the loop guard, exit.
        let stop = AtomicBool::new(true);
        let outcome = f.witness.start(StartMode::Foreground, &stop).unwrap();
        assert_eq!(outcome, StartOutcome::Finished);
        let state = SupervisorState::load(&f.paths.state_file(), "rig").unwrap();
        assert_eq!(state.state, RunState::Stopped);
        assert!(state.started_at.is_some());
    }

    #[test]
    fn stop_requires_running() {
        let f = fixture(false);
        assert!(matches!(f.witness.stop().unwrap_err(), WitnessError::NotRunning));
    }

    #[test]
    fn stop_persists_immediately_and_signals() {
        let f = fixture(false);
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut state = SupervisorState::new("rig");
        state.mark_running(child.id(), Utc::now());
        state.save(&f.paths.state_file()).unwrap();

        let state = f.witness.stop().unwrap();
        assert_eq!(state.state, RunState::Stopped);
        let reread = SupervisorState::load(&f.paths.state_file(), "rig").unwrap();
        assert_eq!(reread.state, RunState::Stopped);
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn loop_ticks_and_exits_when_displaced() {
        let f = fixture(false);
        let stop = Arc::new(AtomicBool::new(false));
        let state_file = f.paths.state_file();

        thread::scope(|s| {
            let handle = s.spawn(|| f.witness.start(StartMode::Foreground, &stop));

            // Wait for a few ticks.
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let state = SupervisorState::load(&state_file, "rig").unwrap();
                if state.stats.total_checks >= 3 {
                    break;
                }
                assert!(Instant::now() < deadline, "witness never ticked");
                thread::sleep(Duration::from_millis(10));
            }

            // A stop from the same pid persists Stopped without a signal.
            let stopped = f.witness.stop().unwrap();
            assert_eq!(stopped.state, RunState::Stopped);
            while !handle.is_finished() {
                assert!(Instant::now() < deadline, "witness ignored the stop");
                thread::sleep(Duration::from_millis(10));
            }
            let state = SupervisorState::load(&state_file, "rig").unwrap();
            assert_eq!(state.state, RunState::Stopped);

            let outcome = handle.join().unwrap().unwrap();
            assert_eq!(outcome, StartOutcome::Finished);
        });

        let audit = std::fs::read_to_string(f.paths.audit_log()).unwrap();
        assert!(audit.contains("\"event\":\"witness_started\""));
        assert!(audit.contains("\"event\":\"health_check\""));
        assert!(audit.contains("\"event\":\"witness_stopped\""));
    }

    #[test]
    fn drain_cleans_and_acks() {
        let f = fixture(false);
        f.mux.add_session("wd-rig-alpha", "claude");
        std::fs::create_dir_all(f.paths.workspace("alpha")).unwrap();
        f.mailbox
            .messages
            .lock()
            .unwrap()
            .push(mail("1", "LIFECYCLE: shutdown alpha", "Worker: alpha"));

        let report = f.witness.drain_inbox();
        assert_eq!(report.cleaned, vec!["alpha"]);
        assert_eq!(report.acked, 1);
        assert!(!f.mux.has_session("wd-rig-alpha").unwrap());
        assert!(!f.paths.workspace("alpha").exists());
        assert_eq!(*f.mailbox.acked.lock().unwrap(), vec!["1"]);
    }

    #[test]
    fn failed_cleanup_is_not_acked() {
        let f = fixture(true);
        f.mailbox
            .messages
            .lock()
            .unwrap()
            .push(mail("1", "LIFECYCLE: shutdown alpha", "Worker: alpha"));

        let report = f.witness.drain_inbox();
        assert_eq!(report.failed, vec!["alpha"]);
        assert_eq!(report.acked, 0);
        assert_eq!(f.mailbox.inbox().unwrap().len(), 1);

        let audit = std::fs::read_to_string(f.paths.audit_log()).unwrap();
        assert!(audit.contains("\"success\":false"));
    }

    #[test]
    fn unparseable_is_acked_and_other_mail_left_alone() {
        let f = fixture(false);
        {
            let mut inbox = f.mailbox.messages.lock().unwrap();
            inbox.push(mail("1", "LIFECYCLE: shutdown", "no worker named"));
            inbox.push(mail("2", "hello witness", "Worker: alpha"));
        }

        let report = f.witness.drain_inbox();
        assert_eq!(report.seen, 2);
        assert_eq!(report.unparseable, 1);
        assert_eq!(report.ignored, 1);
        assert_eq!(*f.mailbox.acked.lock().unwrap(), vec!["1"]);
        let left = f.mailbox.inbox().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "2");
    }

    #[test]
    fn maildir_backed_drain() {
        let f = fixture(false);
        let mbox = MaildirMailbox::open(&f.paths.witness_mailbox()).unwrap();
        mbox.request_shutdown("mayor", "charlie").unwrap();

        let mut config = ProjectConfig::default();
        config.witness.rig = Some("rig".to_string());
        let witness = Witness::new(
            &config,
            f.paths.clone(),
            f.mux.clone(),
            Arc::new(DirVcs { fail: false }),
            Arc::new(mbox),
        );
        let report = witness.drain_inbox();
        assert_eq!(report.cleaned, vec!["charlie"]);
        assert_eq!(report.acked, 1);
        assert_eq!(witness.drain_inbox().seen, 0);
    }
}
