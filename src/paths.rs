use std::path::{Path, PathBuf};

use crate::config::WorkspaceSettings;

const CONTROL_DIR: &str = ".warden";

/// Well-known locations under a project's `.warden/` control directory.
#[derive(Debug, Clone)]
pub struct ControlDir {
    project_root: PathBuf,
    workspace_root: PathBuf,
    repo: PathBuf,
}

impl ControlDir {
    pub fn new(project_root: &Path, workspace: &WorkspaceSettings) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            workspace_root: resolve(project_root, &workspace.root),
            repo: resolve(project_root, &workspace.repo),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn root(&self) -> PathBuf {
        self.project_root.join(CONTROL_DIR)
    }

    pub fn state_file(&self) -> PathBuf {
        self.root().join("witness.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root().join("logs")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.logs_dir().join("witness.jsonl")
    }

    pub fn witness_mailbox(&self) -> PathBuf {
        self.root().join("mail").join("witness")
    }

    /// Directory containing one workspace per worker.
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn workspace(&self, worker: &str) -> PathBuf {
        self.workspace_root.join(worker)
    }

    /// Repository that owns worker worktrees and branches.
    pub fn repo(&self) -> &Path {
        &self.repo
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else if path == Path::new(".") {
        base.to_path_buf()
    } else {
        base.join(path)
    }
}
