//! Message delivery ("nudge") into a worker's pane.
//!
//! A nudge places text in the pane's input stream and presses Enter. Senders
//! to one session are serialized through a FIFO lock; before typing, a
//! detached pane is woken and copy mode is left so keys reach the process.
//! Multi-line or long text goes through tmux paste buffers so the receiver
//! sees one input instead of one per line.

pub mod lock;
pub mod payload;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::NudgeSettings;
use crate::error::ErrorClass;
use crate::tmux::{Multiplexer, MuxError};

pub use lock::SessionLocks;
pub use payload::DeliveryMode;

/// Gap between Escape and Enter so the receiver handles them separately.
const ESCAPE_GAP: Duration = Duration::from_millis(100);

/// Delivery phase, attached to collaborator errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NudgeStep {
    Probe,
    Wake,
    CopyMode,
    Deliver,
    Submit,
}

impl fmt::Display for NudgeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NudgeStep::Probe => "probe",
            NudgeStep::Wake => "wake",
            NudgeStep::CopyMode => "copy-mode",
            NudgeStep::Deliver => "deliver",
            NudgeStep::Submit => "submit",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum NudgeError {
    #[error("timed out after {}s waiting for the delivery lock on '{name}'", waited.as_secs())]
    LockTimeout { name: String, waited: Duration },
    #[error("session '{name}' is gone or its process exited ({step})")]
    DeadTarget { name: String, step: NudgeStep },
    #[error("message is {size} bytes, over the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("message is empty after sanitization")]
    Empty,
    #[error("delivery to '{name}' was cancelled")]
    Cancelled { name: String },
    #[error("nudge {step} failed: {source}")]
    Mux {
        step: NudgeStep,
        #[source]
        source: MuxError,
    },
}

impl NudgeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            NudgeError::LockTimeout { .. } => ErrorClass::TransientContention,
            NudgeError::DeadTarget { .. } => ErrorClass::DeadResource,
            NudgeError::TooLarge { .. } | NudgeError::Empty => ErrorClass::Validation,
            NudgeError::Cancelled { .. } => ErrorClass::Cancelled,
            NudgeError::Mux { source, .. } => match source.class() {
                ErrorClass::TransientContention => ErrorClass::TransientContention,
                _ => ErrorClass::Collaborator,
            },
        }
    }
}

/// What a successful nudge did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NudgeReport {
    pub session: String,
    pub mode: DeliveryMode,
    pub bytes: usize,
    pub chunks: usize,
    pub woke: bool,
    pub left_copy_mode: bool,
    pub lock_wait_ms: u64,
}

/// Serialized message injection.
#[derive(Clone)]
pub struct DeliveryController {
    mux: Arc<dyn Multiplexer>,
    locks: Arc<SessionLocks>,
    settings: NudgeSettings,
}

impl DeliveryController {
    pub fn new(mux: Arc<dyn Multiplexer>, settings: NudgeSettings) -> Self {
        Self {
            mux,
            locks: Arc::new(SessionLocks::new()),
            settings,
        }
    }

    /// Share one lock table between controllers on the same process.
    pub fn with_locks(mut self, locks: Arc<SessionLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn max_message_bytes(&self) -> usize {
        self.settings.max_message_bytes
    }

    /// Deliver `message` to `name` and submit it.
    ///
    /// Success means the payload and the submit key were issued, not that
    /// the receiver acted on them. `stop` aborts lock waiting and everything
    /// up to the first byte of payload; once typing starts the message is
    /// finished so no half-message is left in the input line.
    pub fn send(
        &self,
        name: &str,
        message: &str,
        stop: &AtomicBool,
    ) -> Result<NudgeReport, NudgeError> {
        let text = payload::sanitize(message);
        if text.trim().is_empty() {
            return Err(NudgeError::Empty);
        }
        if text.len() > self.settings.max_message_bytes {
            return Err(NudgeError::TooLarge {
                size: text.len(),
                max: self.settings.max_message_bytes,
            });
        }

        let lock_start = Instant::now();
        let _guard = self
            .locks
            .acquire(
                name,
                Duration::from_secs(self.settings.lock_timeout_secs),
                stop,
            )
            .map_err(|e| match e {
                lock::AcquireError::TimedOut { waited } => NudgeError::LockTimeout {
                    name: name.to_string(),
                    waited,
                },
                lock::AcquireError::Cancelled => NudgeError::Cancelled {
                    name: name.to_string(),
                },
            })?;
        let lock_wait_ms = lock_start.elapsed().as_millis() as u64;

        let step_err = |step: NudgeStep| {
            move |e: MuxError| {
                if e.is_missing_session() {
                    NudgeError::DeadTarget {
                        name: name.to_string(),
                        step,
                    }
                } else {
                    NudgeError::Mux { step, source: e }
                }
            }
        };

        let exists = self
            .mux
            .has_session(name)
            .map_err(step_err(NudgeStep::Probe))?;
        // A dead pane accepts keys and drops them, so it counts as gone.
        if !exists
            || self
                .mux
                .pane_dead(name)
                .map_err(step_err(NudgeStep::Probe))?
        {
            return Err(NudgeError::DeadTarget {
                name: name.to_string(),
                step: NudgeStep::Probe,
            });
        }

        let attached = self
            .mux
            .is_attached(name)
            .map_err(step_err(NudgeStep::Probe))?;
        let mut woke = false;
        if !attached {
            match self.mux.wake(name) {
                Ok(()) => woke = true,
                Err(e) if e.is_missing_session() => return Err(step_err(NudgeStep::Wake)(e)),
                // Best effort: a pane that cannot be resized can still take input.
                Err(e) => warn!(session = name, error = %e, "wake failed, delivering anyway"),
            }
        }

        let in_copy_mode = self
            .mux
            .in_copy_mode(name)
            .map_err(step_err(NudgeStep::CopyMode))?;
        if in_copy_mode {
            self.mux
                .exit_copy_mode(name)
                .map_err(step_err(NudgeStep::CopyMode))?;
            debug!(session = name, "left copy mode before delivery");
        }

        if stop.load(Ordering::SeqCst) {
            return Err(NudgeError::Cancelled {
                name: name.to_string(),
            });
        }

        let mode = payload::choose_mode(&text, self.settings.literal_limit_bytes);
        let chunk_count = match mode {
            DeliveryMode::Literal => {
                self.mux
                    .send_text(name, &text)
                    .map_err(step_err(NudgeStep::Deliver))?;
                1
            }
            DeliveryMode::Paste => {
                let parts = payload::chunks(&text, self.settings.chunk_bytes);
                for part in &parts {
                    self.mux
                        .paste_text(name, part)
                        .map_err(step_err(NudgeStep::Deliver))?;
                }
                parts.len()
            }
        };

        let settle = Duration::from_millis(self.settings.settle_millis);
        thread::sleep(settle);

        if self.settings.escape_before_submit {
            self.mux
                .send_key(name, "Escape")
                .map_err(step_err(NudgeStep::Submit))?;
            if !settle.is_zero() {
                thread::sleep(ESCAPE_GAP);
            }
        }
        self.mux
            .send_key(name, "Enter")
            .map_err(step_err(NudgeStep::Submit))?;

        info!(
            session = name,
            bytes = text.len(),
            chunks = chunk_count,
            mode = ?mode,
            "nudge delivered"
        );
        Ok(NudgeReport {
            session: name.to_string(),
            mode,
            bytes: text.len(),
            chunks: chunk_count,
            woke,
            left_copy_mode: in_copy_mode,
            lock_wait_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::fake::{FakeMux, MuxCall};

    fn settings() -> NudgeSettings {
        NudgeSettings {
            settle_millis: 0,
            ..NudgeSettings::default()
        }
    }

    fn controller(settings: NudgeSettings) -> (Arc<FakeMux>, DeliveryController) {
        let mux = Arc::new(FakeMux::new());
        let ctl = DeliveryController::new(mux.clone(), settings);
        (mux, ctl)
    }

    fn no_stop() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn short_message_is_typed_then_submitted() {
        let (mux, ctl) = controller(settings());
        mux.add_session("s", "claude");
        mux.set_attached("s", true);

        let report = ctl.send("s", "hello there", &no_stop()).unwrap();
        assert_eq!(report.mode, DeliveryMode::Literal);
        assert!(!report.woke);
        assert_eq!(mux.submissions("s"), vec!["hello there"]);
        assert_eq!(
            mux.calls_for("s"),
            vec![
                MuxCall::SendText {
                    name: "s".to_string(),
                    text: "hello there".to_string()
                },
                MuxCall::SendKey {
                    name: "s".to_string(),
                    key: "Escape".to_string()
                },
                MuxCall::SendKey {
                    name: "s".to_string(),
                    key: "Enter".to_string()
                },
            ]
        );
    }

    #[test]
    fn escape_can_be_disabled() {
        let (mux, ctl) = controller(NudgeSettings {
            escape_before_submit: false,
            ..settings()
        });
        mux.add_session("s", "claude");
        mux.set_attached("s", true);
        ctl.send("s", "hi", &no_stop()).unwrap();
        assert!(!mux.calls_for("s").iter().any(
            |c| matches!(c, MuxCall::SendKey { key, .. } if key == "Escape")
        ));
    }

    #[test]
    fn multiline_is_one_atomic_submission() {
        let (mux, ctl) = controller(settings());
        mux.add_session("s", "claude");
        let report = ctl.send("s", "LINE1\nLINE2\nLINE3", &no_stop()).unwrap();
        assert_eq!(report.mode, DeliveryMode::Paste);
        assert_eq!(report.chunks, 1);
        assert_eq!(mux.submissions("s"), vec!["LINE1\nLINE2\nLINE3"]);
    }

    #[test]
    fn detached_pane_is_woken_first() {
        let (mux, ctl) = controller(settings());
        mux.add_session("s", "claude");
        let report = ctl.send("s", "ping", &no_stop()).unwrap();
        assert!(report.woke);
        let calls = mux.calls_for("s");
        assert_eq!(calls[0], MuxCall::Wake { name: "s".to_string() });
    }

    #[test]
    fn wake_failure_is_not_fatal() {
        let (mux, ctl) = controller(settings());
        mux.add_session("s", "claude");
        mux.fail_op("wake");
        let report = ctl.send("s", "ping", &no_stop()).unwrap();
        assert!(!report.woke);
        assert_eq!(mux.submissions("s"), vec!["ping"]);
    }

    #[test]
    fn copy_mode_is_exited_before_typing() {
        let (mux, ctl) = controller(settings());
        mux.add_session("s", "claude");
        mux.set_attached("s", true);
        mux.set_copy_mode("s", true);

        let report = ctl.send("s", "after scroll", &no_stop()).unwrap();
        assert!(report.left_copy_mode);
        assert_eq!(mux.submissions("s"), vec!["after scroll"]);
        assert_eq!(
            mux.calls_for("s")[0],
            MuxCall::ExitCopyMode { name: "s".to_string() }
        );
    }

    #[test]
    fn large_message_is_chunked_and_intact() {
        let (mux, ctl) = controller(settings());
        mux.add_session("s", "claude");
        let line = "0123456789abcdef".repeat(8);
        let message: String = (0..80).map(|_| format!("{line}\n")).collect();
        let expected = message.trim_end().to_string();

        let report = ctl.send("s", &message, &no_stop()).unwrap();
        assert_eq!(report.mode, DeliveryMode::Paste);
        assert_eq!(report.chunks, expected.len().div_ceil(4096));
        assert!(report.chunks > 1);
        assert_eq!(mux.submissions("s"), vec![expected]);
    }

    #[test]
    fn oversized_and_empty_are_rejected_up_front() {
        let (mux, ctl) = controller(NudgeSettings {
            max_message_bytes: 16,
            ..settings()
        });
        mux.add_session("s", "claude");
        let err = ctl.send("s", &"x".repeat(17), &no_stop()).unwrap_err();
        assert!(matches!(err, NudgeError::TooLarge { size: 17, max: 16 }));
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(matches!(
            ctl.send("s", "\x1b[0m\r\n", &no_stop()).unwrap_err(),
            NudgeError::Empty
        ));
        assert!(mux.calls_for("s").is_empty());
    }

    #[test]
    fn missing_session_is_dead_target() {
        let (_mux, ctl) = controller(settings());
        let err = ctl.send("ghost", "hello", &no_stop()).unwrap_err();
        assert!(matches!(
            err,
            NudgeError::DeadTarget {
                step: NudgeStep::Probe,
                ..
            }
        ));
        assert_eq!(err.class(), ErrorClass::DeadResource);
    }

    #[test]
    fn nudge_to_dead_pane_is_dead_target() {
        let (mux, ctl) = controller(settings());
        mux.add_session("s", "claude");
        mux.set_remain_on_exit("s", true).unwrap();
        mux.schedule_exit("s", Duration::ZERO);

        let err = ctl.send("s", "hello", &no_stop()).unwrap_err();
        assert!(matches!(
            err,
            NudgeError::DeadTarget {
                step: NudgeStep::Probe,
                ..
            }
        ));
        assert_eq!(err.class(), ErrorClass::DeadResource);
        assert!(!mux.calls_for("s").iter().any(|c| matches!(
            c,
            MuxCall::SendText { .. } | MuxCall::Paste { .. } | MuxCall::SendKey { .. }
        )));
    }

    #[test]
    fn session_vanishing_mid_delivery_is_dead_target() {
        let (mux, ctl) = controller(settings());
        mux.add_session("s", "claude");
        mux.vanish_on("paste_text");
        let err = ctl.send("s", "a\nb", &no_stop()).unwrap_err();
        assert!(matches!(
            err,
            NudgeError::DeadTarget {
                step: NudgeStep::Deliver,
                ..
            }
        ));
    }

    #[test]
    fn collaborator_failure_names_the_step() {
        let (mux, ctl) = controller(settings());
        mux.add_session("s", "claude");
        mux.set_attached("s", true);
        mux.fail_op("send_key");
        let err = ctl.send("s", "hello", &no_stop()).unwrap_err();
        assert!(matches!(
            err,
            NudgeError::Mux {
                step: NudgeStep::Submit,
                ..
            }
        ));
        assert_eq!(err.class(), ErrorClass::Collaborator);
    }

    #[test]
    fn cancelled_before_delivery_sends_nothing() {
        let (mux, ctl) = controller(settings());
        mux.add_session("s", "claude");
        mux.set_attached("s", true);
        let stop = AtomicBool::new(true);
        let err = ctl.send("s", "hello", &stop).unwrap_err();
        assert!(matches!(err, NudgeError::Cancelled { .. }));
        assert!(mux.submissions("s").is_empty());
        assert!(mux.pending_input("s").is_empty());
    }

    #[test]
    fn lock_timeout_is_contention() {
        let (mux, ctl) = controller(NudgeSettings {
            lock_timeout_secs: 0,
            ..settings()
        });
        mux.add_session("s", "claude");
        let locks = Arc::new(SessionLocks::new());
        let ctl = ctl.with_locks(Arc::clone(&locks));
        let _held = locks
            .acquire("s", Duration::from_secs(1), &no_stop())
            .unwrap();

        let err = ctl.send("s", "hello", &no_stop()).unwrap_err();
        assert!(matches!(err, NudgeError::LockTimeout { .. }));
        assert_eq!(err.class(), ErrorClass::TransientContention);
    }

    #[test]
    fn concurrent_senders_each_arrive_intact() {
        let (mux, ctl) = controller(NudgeSettings {
            settle_millis: 20,
            ..settings()
        });
        mux.add_session("s", "claude");

        let handles: Vec<_> = ["MSG_1", "MSG_2", "MSG_3"]
            .into_iter()
            .map(|msg| {
                let ctl = ctl.clone();
                thread::spawn(move || ctl.send("s", msg, &AtomicBool::new(false)))
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }

        let mut seen = mux.submissions("s");
        seen.sort();
        assert_eq!(seen, vec!["MSG_1", "MSG_2", "MSG_3"]);
    }

    #[test]
    fn different_sessions_deliver_independently() {
        let (mux, ctl) = controller(settings());
        mux.add_session("a", "claude");
        mux.add_session("b", "claude");
        let locks = Arc::new(SessionLocks::new());
        let ctl = ctl.with_locks(Arc::clone(&locks));
        let _held_a = locks
            .acquire("a", Duration::from_secs(5), &no_stop())
            .unwrap();

        ctl.send("b", "free", &no_stop()).unwrap();
        assert_eq!(mux.submissions("b"), vec!["free"]);
    }
}
