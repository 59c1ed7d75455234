//! Bounded execution of collaborator commands (tmux, git, mail tools).
//!
//! Every external call the supervisor makes goes through [`run`], which drains
//! stdout/stderr on reader threads and feeds stdin from a writer thread while
//! waiting on the child with a deadline.
//! A child that outlives its deadline is killed and reported as
//! [`ExecError::TimedOut`]; a timeout is never mistaken for success.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Grace period for reader threads to hand back output after the child exits.
const OUTPUT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(2);

/// Captured result of a finished collaborator command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Trimmed stderr, falling back to stdout when stderr is empty.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' did not finish within {}ms", timeout.as_millis())]
    TimedOut { program: String, timeout: Duration },
    #[error("failed waiting on '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run `cmd` to completion, feeding `stdin` if given, bounded by `timeout`.
pub fn run(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    let program = cmd.get_program().to_string_lossy().to_string();
    let start = Instant::now();

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: program.clone(),
        source,
    })?;

    // Readers must run before we wait, otherwise a chatty child can block on
    // a full pipe and never exit.
    let stdout_rx = drain(child.stdout.take());
    let stderr_rx = drain(child.stderr.take());

    // A child that never reads would block a write on this thread past the
    // deadline; killing it breaks the pipe and ends the writer.
    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let data = data.to_vec();
        let writer_program = program.clone();
        thread::spawn(move || {
            if let Err(e) = pipe.write_all(&data) {
                debug!(program = %writer_program, error = %e, "stdin write to collaborator failed");
            }
            // Dropping the pipe closes it so the child sees EOF.
        });
    }

    let waited = child.wait_timeout(timeout).map_err(|source| ExecError::Wait {
        program: program.clone(),
        source,
    })?;

    let Some(status) = waited else {
        kill_child(&mut child, &program);
        return Err(ExecError::TimedOut { program, timeout });
    };

    let stdout = stdout_rx
        .recv_timeout(OUTPUT_COLLECTION_TIMEOUT)
        .unwrap_or_default();
    let stderr = stderr_rx
        .recv_timeout(OUTPUT_COLLECTION_TIMEOUT)
        .unwrap_or_default();

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        elapsed: start.elapsed(),
    })
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    match stream {
        Some(mut stream) => {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stream.read_to_end(&mut buf);
                let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
            });
        }
        None => {
            let _ = tx.send(String::new());
        }
    }
    rx
}

fn kill_child(child: &mut Child, program: &str) {
    if let Err(e) = child.kill() {
        warn!(program = %program, error = %e, "failed to kill timed-out collaborator");
    }
    let _ = child.wait();
}
