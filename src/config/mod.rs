pub mod render;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".warden";

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_shells() -> Vec<String> {
    ["bash", "zsh", "sh", "fish", "dash", "ksh", "tcsh"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_startup_grace_millis() -> u64 {
    500
}

fn default_capture_lines() -> usize {
    50
}

fn default_width() -> u16 {
    220
}

fn default_height() -> u16 {
    50
}

fn default_poll_interval_millis() -> u64 {
    100
}

fn default_readiness_timeout_secs() -> u64 {
    60
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_settle_millis() -> u64 {
    500
}

fn default_escape_before_submit() -> bool {
    true
}

fn default_literal_limit_bytes() -> usize {
    512
}

fn default_chunk_bytes() -> usize {
    4096
}

fn default_max_message_bytes() -> usize {
    64 * 1024
}

fn default_interval_secs() -> u64 {
    30
}

fn default_witness_command_timeout_secs() -> u64 {
    30
}

fn default_session_prefix() -> String {
    "wd".to_string()
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("workers")
}

fn default_repo() -> PathBuf {
    PathBuf::from(".")
}

fn default_branch_prefix() -> String {
    "worker/".to_string()
}

fn default_mail_program() -> String {
    "bd".to_string()
}

fn default_inbox_args() -> Vec<String> {
    vec!["mail".to_string(), "inbox".to_string(), "--json".to_string()]
}

fn default_ack_args() -> Vec<String> {
    vec!["mail".to_string(), "ack".to_string()]
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TmuxSettings {
    /// Isolated server name passed as `tmux -L <socket>`.
    #[serde(default)]
    pub socket: Option<String>,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for TmuxSettings {
    fn default() -> Self {
        Self {
            socket: None,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionSettings {
    /// Foreground command names that count as "still at the shell".
    #[serde(default = "default_shells")]
    pub shells: Vec<String>,
    #[serde(default = "default_startup_grace_millis")]
    pub startup_grace_millis: u64,
    #[serde(default = "default_capture_lines")]
    pub capture_lines: usize,
    #[serde(default = "default_width")]
    pub width: u16,
    #[serde(default = "default_height")]
    pub height: u16,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            shells: default_shells(),
            startup_grace_millis: default_startup_grace_millis(),
            capture_lines: default_capture_lines(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl SessionSettings {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_millis)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadinessSettings {
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    #[serde(default = "default_readiness_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            poll_interval_millis: default_poll_interval_millis(),
            timeout_secs: default_readiness_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NudgeSettings {
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Pause between placing the payload and pressing Enter.
    #[serde(default = "default_settle_millis")]
    pub settle_millis: u64,
    /// Send Escape before Enter to leave an editor's insert mode.
    #[serde(default = "default_escape_before_submit")]
    pub escape_before_submit: bool,
    /// Single-line payloads up to this size are typed with `send-keys -l`.
    #[serde(default = "default_literal_limit_bytes")]
    pub literal_limit_bytes: usize,
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for NudgeSettings {
    fn default() -> Self {
        Self {
            lock_timeout_secs: default_lock_timeout_secs(),
            settle_millis: default_settle_millis(),
            escape_before_submit: default_escape_before_submit(),
            literal_limit_bytes: default_literal_limit_bytes(),
            chunk_bytes: default_chunk_bytes(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WitnessSettings {
    /// Rig identifier; the project directory name when unset.
    #[serde(default)]
    pub rig: Option<String>,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Bound on each git and mailbox call made from the loop.
    #[serde(default = "default_witness_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
}

impl Default for WitnessSettings {
    fn default() -> Self {
        Self {
            rig: None,
            interval_secs: default_interval_secs(),
            command_timeout_secs: default_witness_command_timeout_secs(),
            session_prefix: default_session_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkspaceSettings {
    /// Directory holding one workspace per worker, relative to the project.
    #[serde(default = "default_workspace_root")]
    pub root: PathBuf,
    /// Repository whose worktrees and branches back the workspaces.
    #[serde(default = "default_repo")]
    pub repo: PathBuf,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            repo: default_repo(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MailboxKind {
    #[default]
    Maildir,
    Command,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MailboxSettings {
    #[serde(default)]
    pub kind: MailboxKind,
    #[serde(default = "default_mail_program")]
    pub program: String,
    #[serde(default = "default_inbox_args")]
    pub inbox_args: Vec<String>,
    #[serde(default = "default_ack_args")]
    pub ack_args: Vec<String>,
    /// Identity exported as `WARDEN_AGENT_NAME`; `<rig>-witness` when unset.
    #[serde(default)]
    pub identity: Option<String>,
}

impl Default for MailboxSettings {
    fn default() -> Self {
        Self {
            kind: MailboxKind::default(),
            program: default_mail_program(),
            inbox_args: default_inbox_args(),
            ack_args: default_ack_args(),
            identity: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub tmux: TmuxSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub readiness: ReadinessSettings,
    #[serde(default)]
    pub nudge: NudgeSettings,
    #[serde(default)]
    pub witness: WitnessSettings,
    #[serde(default)]
    pub workspace: WorkspaceSettings,
    #[serde(default)]
    pub mailbox: MailboxSettings,
}

impl ProjectConfig {
    /// Search upward from `start` for a `.warden/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ProjectConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ProjectConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Project root for a loaded config: the parent of `.warden/`.
    pub fn project_root(config_path: Option<&Path>, fallback: &Path) -> PathBuf {
        config_path
            .and_then(Path::parent)
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| fallback.to_path_buf())
    }

    pub fn rig_name(&self, project_root: &Path) -> String {
        if let Some(rig) = &self.witness.rig {
            return rig.clone();
        }
        project_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "default".to_string())
    }

    pub fn mailbox_identity(&self, project_root: &Path) -> String {
        self.mailbox
            .identity
            .clone()
            .unwrap_or_else(|| format!("{}-witness", self.rig_name(project_root)))
    }
}
