//! Git teardown of worker workspaces.
//!
//! Each worker runs in its own worktree on branch `<branch_prefix><worker>`.
//! Teardown removes the worktree (falling back to deleting a plain directory)
//! and force-deletes the branch. Both operations report absence separately so
//! callers can treat "already gone" as success.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::exec::{self, CommandOutput, ExecError};

#[derive(Debug, Error)]
pub enum VcsError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("git {op} failed: {stderr}")]
    Command { op: &'static str, stderr: String },
    #[error("failed to remove {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    Absent,
}

/// Version-control collaborator used by cleanup.
pub trait Vcs: Send + Sync {
    /// Remove the worktree at `path`; `Absent` when nothing is there.
    fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<Removal, VcsError>;
    /// Force-delete `branch`; `Absent` when it no longer exists.
    fn delete_branch(&self, repo: &Path, branch: &str) -> Result<Removal, VcsError>;
}

/// `git` CLI implementation of [`Vcs`], every call bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct Git {
    timeout: Duration,
}

impl Git {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn run(&self, repo: &Path, args: &[&str]) -> Result<CommandOutput, VcsError> {
        let mut cmd = Command::new("git");
        cmd.current_dir(repo).args(args);
        Ok(exec::run(cmd, None, self.timeout)?)
    }

    pub fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool, VcsError> {
        let ref_name = format!("refs/heads/{branch}");
        let output = self.run(repo, &["show-ref", "--verify", "--quiet", ref_name.as_str()])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(VcsError::Command {
                op: "show-ref",
                stderr: output.diagnostic(),
            }),
        }
    }

    fn prune(&self, repo: &Path) {
        match self.run(repo, &["worktree", "prune"]) {
            Ok(out) if out.success() => {}
            Ok(out) => debug!(repo = %repo.display(), stderr = %out.diagnostic(), "worktree prune failed"),
            Err(e) => debug!(repo = %repo.display(), error = %e, "worktree prune failed"),
        }
    }
}

impl Vcs for Git {
    fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<Removal, VcsError> {
        if !path.exists() {
            // Drop a stale registration left by a manual delete.
            self.prune(repo);
            return Ok(Removal::Absent);
        }

        let path_s = path.to_string_lossy().to_string();
        let output = self.run(repo, &["worktree", "remove", "--force", path_s.as_str()])?;
        if output.success() {
            return Ok(Removal::Removed);
        }

        let stderr = output.diagnostic();
        if stderr.contains("is not a working tree") {
            warn!(path = %path.display(), "workspace is not a git worktree, deleting directory");
            std::fs::remove_dir_all(path).map_err(|source| VcsError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            self.prune(repo);
            return Ok(Removal::Removed);
        }
        Err(VcsError::Command {
            op: "worktree remove",
            stderr,
        })
    }

    fn delete_branch(&self, repo: &Path, branch: &str) -> Result<Removal, VcsError> {
        if !self.branch_exists(repo, branch)? {
            return Ok(Removal::Absent);
        }

        let output = self.run(repo, &["branch", "-D", branch])?;
        if output.success() {
            return Ok(Removal::Removed);
        }
        // Someone else may have deleted it in between.
        if !self.branch_exists(repo, branch)? {
            return Ok(Removal::Absent);
        }
        Err(VcsError::Command {
            op: "branch -D",
            stderr: output.diagnostic(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(repo: &Path, args: &[&str]) {
        let output = Command::new("git")
            .current_dir(repo)
            .args(args)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn init_repo() -> Option<tempfile::TempDir> {
        if !git_available() {
            return None;
        }

        let tmp = tempfile::tempdir().unwrap();
        git(tmp.path(), &["init", "-q"]);
        git(tmp.path(), &["config", "user.email", "warden-test@example.com"]);
        git(tmp.path(), &["config", "user.name", "Warden Test"]);

        fs::write(tmp.path().join("README.md"), "init\n").unwrap();
        git(tmp.path(), &["add", "README.md"]);
        git(tmp.path(), &["commit", "-q", "-m", "init"]);

        Some(tmp)
    }

    fn add_worktree(repo: &Path, path: &Path, branch: &str) {
        let path_s = path.to_string_lossy().to_string();
        git(repo, &["worktree", "add", "-q", "-b", branch, path_s.as_str()]);
    }

    fn git_tool() -> Git {
        Git::new(Duration::from_secs(30))
    }

    #[test]
    fn removes_worktree_and_branch() {
        let Some(tmp) = init_repo() else {
            return;
        };
        let repo = tmp.path();
        let wt = repo.join("workers").join("alpha");
        add_worktree(repo, &wt, "worker/alpha");

        let g = git_tool();
        assert!(g.branch_exists(repo, "worker/alpha").unwrap());
        assert_eq!(g.remove_worktree(repo, &wt).unwrap(), Removal::Removed);
        assert!(!wt.exists());
        assert_eq!(g.delete_branch(repo, "worker/alpha").unwrap(), Removal::Removed);
        assert!(!g.branch_exists(repo, "worker/alpha").unwrap());
    }

    #[test]
    fn absent_worktree_and_branch_are_reported() {
        let Some(tmp) = init_repo() else {
            return;
        };
        let repo = tmp.path();
        let g = git_tool();
        assert_eq!(
            g.remove_worktree(repo, &repo.join("workers").join("ghost"))
                .unwrap(),
            Removal::Absent
        );
        assert_eq!(g.delete_branch(repo, "worker/ghost").unwrap(), Removal::Absent);
    }

    #[test]
    fn manually_deleted_worktree_is_absent_and_pruned() {
        let Some(tmp) = init_repo() else {
            return;
        };
        let repo = tmp.path();
        let wt = repo.join("workers").join("bravo");
        add_worktree(repo, &wt, "worker/bravo");
        fs::remove_dir_all(&wt).unwrap();

        let g = git_tool();
        assert_eq!(g.remove_worktree(repo, &wt).unwrap(), Removal::Absent);
        // Pruned registration lets the branch go.
        assert_eq!(g.delete_branch(repo, "worker/bravo").unwrap(), Removal::Removed);
    }

    #[test]
    fn plain_directory_is_deleted() {
        let Some(tmp) = init_repo() else {
            return;
        };
        let repo = tmp.path();
        let dir = repo.join("workers").join("plain");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("notes.txt"), "x").unwrap();

        assert_eq!(
            git_tool().remove_worktree(repo, &dir).unwrap(),
            Removal::Removed
        );
        assert!(!dir.exists());
    }
}
