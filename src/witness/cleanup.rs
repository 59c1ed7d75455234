//! Worker teardown: session, then workspace, then branch.
//!
//! Only workspace removal is allowed to fail the sequence. Session stop and
//! branch deletion failures are logged and recorded in the outcome. Every
//! step tolerates its target already being gone, so the whole sequence can
//! be re-run after a partial failure.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::ErrorClass;
use crate::mailbox::{RequestError, validate_worker};
use crate::paths::ControlDir;
use crate::session::{SessionController, worker_session_name};
use crate::worktree::{Removal, Vcs, VcsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    StopSession,
    RemoveWorkspace,
    DeleteBranch,
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CleanupStep::StopSession => "stop_session",
            CleanupStep::RemoveWorkspace => "remove_workspace",
            CleanupStep::DeleteBranch => "delete_branch",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepStatus {
    Done,
    /// Nothing to do; the target was already gone.
    Absent,
    /// Not attempted because an earlier step failed.
    Skipped,
    Failed(String),
}

impl StepStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepStatus::Failed(_))
    }

    pub fn label(&self) -> String {
        match self {
            StepStatus::Done => "done".to_string(),
            StepStatus::Absent => "absent".to_string(),
            StepStatus::Skipped => "skipped".to_string(),
            StepStatus::Failed(e) => format!("failed: {e}"),
        }
    }
}

impl From<Removal> for StepStatus {
    fn from(r: Removal) -> Self {
        match r {
            Removal::Removed => StepStatus::Done,
            Removal::Absent => StepStatus::Absent,
        }
    }
}

/// Per-step result of tearing down one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupOutcome {
    pub worker: String,
    pub session: String,
    pub workspace_path: PathBuf,
    pub branch: String,
    pub session_stop: StepStatus,
    pub workspace: StepStatus,
    pub branch_delete: StepStatus,
}

impl CleanupOutcome {
    /// Gated on workspace removal alone.
    pub fn succeeded(&self) -> bool {
        !self.workspace.is_failed() && self.workspace != StepStatus::Skipped
    }

    pub fn steps(&self) -> [(CleanupStep, &StepStatus); 3] {
        [
            (CleanupStep::StopSession, &self.session_stop),
            (CleanupStep::RemoveWorkspace, &self.workspace),
            (CleanupStep::DeleteBranch, &self.branch_delete),
        ]
    }
}

/// The hard step failed; `outcome` shows what happened before it.
#[derive(Debug, Error)]
#[error("cleanup of '{worker}' failed at {step}: {source}")]
pub struct PartialCleanupError {
    pub worker: String,
    pub step: CleanupStep,
    #[source]
    pub source: VcsError,
    pub outcome: CleanupOutcome,
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error(transparent)]
    InvalidWorker(#[from] RequestError),
    #[error(transparent)]
    Partial(#[from] PartialCleanupError),
}

impl CleanupError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CleanupError::InvalidWorker(_) => ErrorClass::Validation,
            CleanupError::Partial(_) => ErrorClass::PartialCleanup,
        }
    }
}

/// Fixed-order teardown of a worker's session, workspace and branch.
#[derive(Clone)]
pub struct CleanupSequence {
    sessions: SessionController,
    vcs: Arc<dyn Vcs>,
    paths: ControlDir,
    session_prefix: String,
    rig: String,
    branch_prefix: String,
}

impl CleanupSequence {
    pub fn new(
        sessions: SessionController,
        vcs: Arc<dyn Vcs>,
        paths: ControlDir,
        session_prefix: &str,
        rig: &str,
        branch_prefix: &str,
    ) -> Self {
        Self {
            sessions,
            vcs,
            paths,
            session_prefix: session_prefix.to_string(),
            rig: rig.to_string(),
            branch_prefix: branch_prefix.to_string(),
        }
    }

    pub fn session_name(&self, worker: &str) -> String {
        worker_session_name(&self.session_prefix, &self.rig, worker)
    }

    pub fn branch_name(&self, worker: &str) -> String {
        format!("{}{worker}", self.branch_prefix)
    }

    pub fn run(&self, worker: &str) -> Result<CleanupOutcome, CleanupError> {
        validate_worker(worker)?;

        let mut outcome = CleanupOutcome {
            worker: worker.to_string(),
            session: self.session_name(worker),
            workspace_path: self.paths.workspace(worker),
            branch: self.branch_name(worker),
            session_stop: StepStatus::Skipped,
            workspace: StepStatus::Skipped,
            branch_delete: StepStatus::Skipped,
        };

        outcome.session_stop = match self.sessions.kill(&outcome.session) {
            Ok(true) => StepStatus::Done,
            Ok(false) => StepStatus::Absent,
            Err(e) => {
                warn!(worker, session = %outcome.session, error = %e, "failed to stop worker session, continuing");
                StepStatus::Failed(e.to_string())
            }
        };

        match self
            .vcs
            .remove_worktree(self.paths.repo(), &outcome.workspace_path)
        {
            Ok(removal) => outcome.workspace = removal.into(),
            Err(e) => {
                outcome.workspace = StepStatus::Failed(e.to_string());
                return Err(PartialCleanupError {
                    worker: worker.to_string(),
                    step: CleanupStep::RemoveWorkspace,
                    source: e,
                    outcome,
                }
                .into());
            }
        }

        outcome.branch_delete = match self.vcs.delete_branch(self.paths.repo(), &outcome.branch) {
            Ok(removal) => removal.into(),
            Err(e) => {
                warn!(worker, branch = %outcome.branch, error = %e, "failed to delete worker branch");
                StepStatus::Failed(e.to_string())
            }
        };

        info!(
            worker,
            session = %outcome.session_stop.label(),
            workspace = %outcome.workspace.label(),
            branch = %outcome.branch_delete.label(),
            "worker cleaned up"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionSettings, WorkspaceSettings};
    use crate::tmux::fake::FakeMux;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records calls; workspaces "exist" when their directory does.
    #[derive(Default)]
    struct StubVcs {
        branches: Mutex<HashSet<String>>,
        fail_remove: bool,
        fail_branch: bool,
        calls: Mutex<Vec<String>>,
    }

    impl Vcs for StubVcs {
        fn remove_worktree(&self, _repo: &Path, path: &Path) -> Result<Removal, VcsError> {
            self.calls.lock().unwrap().push("remove_worktree".to_string());
            if self.fail_remove {
                return Err(VcsError::Command {
                    op: "worktree remove",
                    stderr: "locked".to_string(),
                });
            }
            if !path.exists() {
                return Ok(Removal::Absent);
            }
            std::fs::remove_dir_all(path).unwrap();
            Ok(Removal::Removed)
        }

        fn delete_branch(&self, _repo: &Path, branch: &str) -> Result<Removal, VcsError> {
            self.calls.lock().unwrap().push("delete_branch".to_string());
            if self.fail_branch {
                return Err(VcsError::Command {
                    op: "branch -D",
                    stderr: "boom".to_string(),
                });
            }
            Ok(if self.branches.lock().unwrap().remove(branch) {
                Removal::Removed
            } else {
                Removal::Absent
            })
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        mux: Arc<FakeMux>,
        vcs: Arc<StubVcs>,
        seq: CleanupSequence,
        paths: ControlDir,
    }

    fn fixture(vcs: StubVcs) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let paths = ControlDir::new(tmp.path(), &WorkspaceSettings::default());
        let mux = Arc::new(FakeMux::new());
        let sessions = SessionController::new(mux.clone(), &SessionSettings::default())
            .with_grace(Duration::ZERO);
        let vcs = Arc::new(vcs);
        let seq = CleanupSequence::new(
            sessions,
            vcs.clone(),
            paths.clone(),
            "wd",
            "rig",
            "worker/",
        );
        Fixture {
            _tmp: tmp,
            mux,
            vcs,
            seq,
            paths,
        }
    }

    fn stub_with_branch(branch: &str) -> StubVcs {
        let vcs = StubVcs::default();
        vcs.branches.lock().unwrap().insert(branch.to_string());
        vcs
    }

    #[test]
    fn full_teardown() {
        let f = fixture(stub_with_branch("worker/alpha"));
        f.mux.add_session("wd-rig-alpha", "claude");
        std::fs::create_dir_all(f.paths.workspace("alpha")).unwrap();

        let outcome = f.seq.run("alpha").unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.session_stop, StepStatus::Done);
        assert_eq!(outcome.workspace, StepStatus::Done);
        assert_eq!(outcome.branch_delete, StepStatus::Done);
        assert!(!f.mux.has_session("wd-rig-alpha").unwrap());
        assert!(!f.paths.workspace("alpha").exists());
    }

    #[test]
    fn already_deleted_workspace_still_deletes_branch() {
        let f = fixture(stub_with_branch("worker/alpha"));
        let outcome = f.seq.run("alpha").unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.session_stop, StepStatus::Absent);
        assert_eq!(outcome.workspace, StepStatus::Absent);
        assert_eq!(outcome.branch_delete, StepStatus::Done);
    }

    #[test]
    fn rerun_is_idempotent() {
        let f = fixture(stub_with_branch("worker/alpha"));
        std::fs::create_dir_all(f.paths.workspace("alpha")).unwrap();
        f.seq.run("alpha").unwrap();
        let again = f.seq.run("alpha").unwrap();
        assert!(again.succeeded());
        assert_eq!(again.workspace, StepStatus::Absent);
        assert_eq!(again.branch_delete, StepStatus::Absent);
    }

    #[test]
    fn workspace_failure_aborts_before_branch() {
        let f = fixture(StubVcs {
            fail_remove: true,
            ..stub_with_branch("worker/alpha")
        });
        f.mux.add_session("wd-rig-alpha", "claude");

        let err = f.seq.run("alpha").unwrap_err();
        assert_eq!(err.class(), ErrorClass::PartialCleanup);
        let CleanupError::Partial(partial) = err else {
            panic!("expected partial cleanup error");
        };
        assert_eq!(partial.step, CleanupStep::RemoveWorkspace);
        assert_eq!(partial.outcome.session_stop, StepStatus::Done);
        assert!(partial.outcome.workspace.is_failed());
        assert_eq!(partial.outcome.branch_delete, StepStatus::Skipped);
        assert_eq!(*f.vcs.calls.lock().unwrap(), vec!["remove_worktree"]);
    }

    #[test]
    fn soft_failures_do_not_fail_the_sequence() {
        let f = fixture(StubVcs {
            fail_branch: true,
            ..StubVcs::default()
        });
        f.mux.add_session("wd-rig-alpha", "claude");
        f.mux.fail_op("kill_session");

        let outcome = f.seq.run("alpha").unwrap();
        assert!(outcome.succeeded());
        assert!(outcome.session_stop.is_failed());
        assert!(outcome.branch_delete.is_failed());
    }

    #[test]
    fn invalid_worker_touches_nothing() {
        let f = fixture(StubVcs::default());
        let err = f.seq.run("../etc").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(f.vcs.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn step_status_serializes_tagged() {
        let json = serde_json::to_string(&StepStatus::Failed("x".to_string())).unwrap();
        assert_eq!(json, r#"{"status":"failed","detail":"x"}"#);
        assert_eq!(
            serde_json::to_string(&StepStatus::Absent).unwrap(),
            r#"{"status":"absent"}"#
        );
    }
}
