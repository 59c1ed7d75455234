//! Persisted witness state (`.warden/witness.json`).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to access state file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt state file {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Exclusive advisory lock on a state file, released on drop.
///
/// Every read-modify-write of the state goes through one of these so a
/// health check cannot overwrite a concurrent stop.
#[derive(Debug)]
pub struct StateLock {
    file: File,
}

impl StateLock {
    /// Block until the lock beside `path` (`<file>.lock`) is held.
    pub fn acquire(path: &Path) -> Result<Self, StateError> {
        let lock_path = lock_path(path);
        let io_err = |source| StateError::Io {
            path: lock_path.clone(),
            source,
        };
        if let Some(dir) = lock_path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(io_err)?;
        file.lock_exclusive().map_err(io_err)?;
        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state".into());
    name.push(".lock");
    path.with_file_name(name)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Stopped,
    Running,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckStats {
    #[serde(default)]
    pub total_checks: u64,
    #[serde(default)]
    pub today_checks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorState {
    pub rig_name: String,
    #[serde(default)]
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: CheckStats,
    #[serde(default)]
    pub monitored_workers: Vec<String>,
}

impl SupervisorState {
    pub fn new(rig_name: &str) -> Self {
        Self {
            rig_name: rig_name.to_string(),
            state: RunState::Stopped,
            pid: None,
            started_at: None,
            last_check_at: None,
            stats: CheckStats::default(),
            monitored_workers: Vec::new(),
        }
    }

    /// Load the state file, or a fresh Stopped state if there is none.
    pub fn load(path: &Path, rig_name: &str) -> Result<Self, StateError> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new(rig_name)),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&data).map_err(|source| StateError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Rewrite the whole file atomically: write a sibling temp file, then
    /// rename it over the target.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(io_err)?;

        let json = serde_json::to_string_pretty(self).map_err(|source| StateError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "state".to_string());
        let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(e));
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    /// Whether the file says `pid` is the running owner.
    pub fn owned_by(&self, pid: u32) -> bool {
        self.is_running() && self.pid == Some(pid)
    }

    pub fn mark_running(&mut self, pid: u32, now: DateTime<Utc>) {
        self.state = RunState::Running;
        self.pid = Some(pid);
        self.started_at = Some(now);
    }

    pub fn mark_stopped(&mut self) {
        self.state = RunState::Stopped;
        self.pid = None;
    }

    /// Count one health check. `today_checks` restarts when the local date
    /// of the previous check differs from the date of `now`.
    pub fn record_check(&mut self, now: DateTime<Utc>) {
        let same_day = self.last_check_at.is_some_and(|last| {
            last.with_timezone(&Local).date_naive() == now.with_timezone(&Local).date_naive()
        });
        if !same_day {
            self.stats.today_checks = 0;
        }
        self.stats.total_checks += 1;
        self.stats.today_checks += 1;
        self.last_check_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn missing_file_loads_as_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let state = SupervisorState::load(&tmp.path().join("witness.json"), "rig").unwrap();
        assert_eq!(state.state, RunState::Stopped);
        assert_eq!(state.rig_name, "rig");
        assert!(state.pid.is_none());
    }

    #[test]
    fn save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".warden").join("witness.json");
        let mut state = SupervisorState::new("gastown");
        state.mark_running(4242, Utc::now());
        state.monitored_workers = vec!["alpha".to_string()];
        state.save(&path).unwrap();

        let loaded = SupervisorState::load(&path, "ignored").unwrap();
        assert_eq!(loaded, state);
        assert!(loaded.owned_by(4242));
        assert!(!loaded.owned_by(1));

        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn json_uses_snake_case_fields() {
        let mut state = SupervisorState::new("rig");
        state.mark_running(7, Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["rig_name"], "rig");
        assert_eq!(json["state"], "running");
        assert_eq!(json["pid"], 7);
        assert_eq!(json["stats"]["total_checks"], 0);
        assert!(json["started_at"].as_str().unwrap().starts_with("2026-01-02T03:04:05"));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("witness.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            SupervisorState::load(&path, "rig"),
            Err(StateError::Json { .. })
        ));
    }

    #[test]
    fn stop_clears_pid() {
        let mut state = SupervisorState::new("rig");
        state.mark_running(9, Utc::now());
        state.mark_stopped();
        assert_eq!(state.state, RunState::Stopped);
        assert!(state.pid.is_none());
        assert!(!state.owned_by(9));
    }

    #[test]
    fn lock_serializes_holders() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;
        use std::time::Duration as StdDuration;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".warden").join("witness.json");
        assert_eq!(
            lock_path(&path),
            tmp.path().join(".warden").join("witness.json.lock")
        );

        let held = StateLock::acquire(&path).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let path = path.clone();
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _lock = StateLock::acquire(&path).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(StdDuration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(held);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn check_counters_reset_on_new_day() {
        let mut state = SupervisorState::new("rig");
        let t0 = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        state.record_check(t0);
        state.record_check(t0 + Duration::seconds(30));
        assert_eq!(state.stats.total_checks, 2);
        assert_eq!(state.stats.today_checks, 2);

        state.record_check(t0 + Duration::days(2));
        assert_eq!(state.stats.total_checks, 3);
        assert_eq!(state.stats.today_checks, 1);
        assert_eq!(state.last_check_at, Some(t0 + Duration::days(2)));
    }
}
