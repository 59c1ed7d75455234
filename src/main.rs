use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::debug;

use warden::cli::{Cli, Command, SessionCommand, WitnessCommand};
use warden::config::{MailboxKind, ProjectConfig, render};
use warden::log::AuditLog;
use warden::mailbox::{CommandMailbox, Mailbox, MaildirMailbox};
use warden::nudge::DeliveryController;
use warden::paths::ControlDir;
use warden::readiness::ReadinessWaiter;
use warden::session::{SessionController, SessionState};
use warden::shell_completion;
use warden::tmux::{Multiplexer, Tmux};
use warden::witness::{StartMode, StartOutcome, SupervisorState, Witness};
use warden::worktree::Git;

struct App {
    config: ProjectConfig,
    config_path: Option<PathBuf>,
    root: PathBuf,
    paths: ControlDir,
    stop: Arc<AtomicBool>,
    verbose: u8,
}

impl App {
    fn mux(&self) -> Arc<dyn Multiplexer> {
        Arc::new(Tmux::from_settings(&self.config.tmux, &self.config.session))
    }

    fn sessions(&self) -> SessionController {
        SessionController::new(self.mux(), &self.config.session)
    }

    fn mailbox(&self) -> Result<Arc<dyn Mailbox>> {
        let settings = &self.config.mailbox;
        Ok(match settings.kind {
            MailboxKind::Maildir => {
                let dir = self.paths.witness_mailbox();
                Arc::new(
                    MaildirMailbox::open(&dir)
                        .with_context(|| format!("failed to open mailbox {}", dir.display()))?,
                )
            }
            MailboxKind::Command => Arc::new(CommandMailbox::new(
                settings.program.clone(),
                settings.inbox_args.clone(),
                settings.ack_args.clone(),
                self.config.mailbox_identity(&self.root),
                &self.root,
                Duration::from_secs(self.config.witness.command_timeout_secs),
            )),
        })
    }

    fn witness(&self) -> Result<Witness> {
        let vcs = Arc::new(Git::new(Duration::from_secs(
            self.config.witness.command_timeout_secs,
        )));
        let audit_path = self.paths.audit_log();
        let audit = AuditLog::open(&audit_path)
            .with_context(|| format!("failed to open audit log {}", audit_path.display()))?;
        Ok(Witness::new(
            &self.config,
            self.paths.clone(),
            self.mux(),
            vcs,
            self.mailbox()?,
        )
        .with_audit(audit))
    }
}

fn init_logging(cli: &Cli) {
    let quiet_by_default = matches!(
        &cli.command,
        Command::Config { .. } | Command::Completions { .. }
    );
    let filter = match cli.verbose {
        _ if cli.quiet => "warden=warn",
        0 if quiet_by_default => "warden=warn",
        0 => "warden=info",
        1 => "warden=debug",
        _ => "warden=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn read_message(arg: &str) -> Result<String> {
    if arg != "-" {
        return Ok(arg.to_string());
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("failed to read message from stdin")?;
    Ok(buf)
}

fn print_state(state: &SupervisorState) {
    println!("rig:        {}", state.rig_name);
    match state.pid {
        Some(pid) if state.is_running() => println!("state:      running (pid {pid})"),
        _ => println!("state:      stopped"),
    }
    if let Some(started) = state.started_at {
        println!("started:    {}", started.to_rfc3339());
    }
    match state.last_check_at {
        Some(at) => println!("last check: {}", at.to_rfc3339()),
        None => println!("last check: never"),
    }
    println!(
        "checks:     {} total, {} today",
        state.stats.total_checks, state.stats.today_checks
    );
    if state.monitored_workers.is_empty() {
        println!("workers:    (none)");
    } else {
        println!("workers:    {}", state.monitored_workers.join(", "));
    }
}

fn run_session(app: &App, action: SessionCommand) -> Result<()> {
    let sessions = app.sessions();
    match action {
        SessionCommand::Create {
            name,
            workdir,
            wait,
            command,
        } => {
            let command = SessionCommand::joined_command(&command);
            sessions
                .create(&name, workdir.as_deref(), &command)
                .with_context(|| format!("failed to create session '{name}'"))?;
            println!("created session {name}");
            if wait {
                wait_ready(app, &sessions, &name, None)?;
            }
        }
        SessionCommand::Kill { name } => {
            if sessions
                .kill(&name)
                .with_context(|| format!("failed to kill session '{name}'"))?
            {
                println!("killed session {name}");
            } else {
                println!("session {name} not found");
            }
        }
        SessionCommand::Status { name, json } => {
            let state = sessions.classify(&name, &app.config.session.shells);
            let snapshot = sessions
                .probe()
                .snapshot(&name)
                .with_context(|| format!("failed to inspect session '{name}'"))?;
            let launch = sessions.launch_command(&name);
            if json {
                let payload = serde_json::json!({
                    "session": name,
                    "state": state,
                    "launch_command": launch,
                    "pane": snapshot,
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload).context("failed to serialize status")?
                );
            } else {
                println!("session:  {name}");
                println!("state:    {state}");
                if let Some(launch) = launch {
                    println!("launched: {launch}");
                }
                if let Some(snap) = snapshot {
                    println!("command:  {}", snap.command);
                    println!("attached: {}", snap.attached);
                    println!("copymode: {}", snap.copy_mode);
                }
            }
            if state == SessionState::Dead {
                bail!("session '{name}' does not exist or has exited");
            }
        }
        SessionCommand::Wait { name, timeout } => {
            wait_ready(app, &sessions, &name, timeout.map(Duration::from_secs))?;
        }
    }
    Ok(())
}

fn wait_ready(
    app: &App,
    sessions: &SessionController,
    name: &str,
    timeout: Option<Duration>,
) -> Result<()> {
    let waiter = ReadinessWaiter::new(sessions.probe().clone(), &app.config.readiness);
    let timeout =
        timeout.unwrap_or_else(|| Duration::from_secs(app.config.readiness.timeout_secs));
    let command = waiter
        .wait_for_non_shell(name, &app.config.session.shells, timeout, &app.stop)
        .with_context(|| format!("session '{name}' did not become ready"))?;
    println!("session {name} ready ({command})");
    Ok(())
}

fn run_witness(app: &App, action: WitnessCommand) -> Result<()> {
    match action {
        WitnessCommand::Start { foreground } => {
            let witness = app.witness()?;
            let mode = if foreground {
                StartMode::Foreground
            } else {
                let exe = std::env::current_exe().context("failed to locate warden executable")?;
                let mut args: Vec<String> = Vec::new();
                if app.verbose > 0 {
                    args.push(format!("-{}", "v".repeat(app.verbose.into())));
                }
                args.extend(["witness".to_string(), "run".to_string()]);
                StartMode::Background { program: exe, args }
            };
            match witness.start(mode, &app.stop)? {
                StartOutcome::Finished => {}
                StartOutcome::Spawned { pid, log } => {
                    println!(
                        "[warden] witness for {} started in background (pid: {pid})",
                        witness.rig()
                    );
                    println!("[warden] log: {}", log.display());
                }
            }
        }
        WitnessCommand::Run => {
            app.witness()?.run_owned(&app.stop, false)?;
        }
        WitnessCommand::Stop => {
            let state = app.witness()?.stop()?;
            println!("witness for {} stopped", state.rig_name);
        }
        WitnessCommand::Status { json } => {
            let state = app.witness()?.status()?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&state).context("failed to serialize state")?
                );
            } else {
                print_state(&state);
            }
        }
        WitnessCommand::Cleanup { worker } => {
            let outcome = app.witness()?.cleanup_worker(&worker)?;
            for (step, status) in outcome.steps() {
                println!("  {step:<16} {}", status.label());
            }
            println!("worker {worker} cleaned up");
        }
        WitnessCommand::RequestShutdown { worker, from } => {
            if app.config.mailbox.kind != MailboxKind::Maildir {
                bail!(
                    "request-shutdown writes to the built-in maildir; send the request through '{}' instead",
                    app.config.mailbox.program
                );
            }
            warden::mailbox::validate_worker(&worker)?;
            let dir = app.paths.witness_mailbox();
            let mailbox = MaildirMailbox::open(&dir)
                .with_context(|| format!("failed to open mailbox {}", dir.display()))?;
            let id = mailbox.request_shutdown(&from, &worker)?;
            println!("queued shutdown request for {worker} ({id})");
        }
    }
    Ok(())
}

fn project_paths(config: &ProjectConfig, config_path: Option<&Path>, cwd: &Path) -> (PathBuf, ControlDir) {
    let root = ProjectConfig::project_root(config_path, cwd);
    let paths = ControlDir::new(&root, &config.workspace);
    (root, paths)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Command::Completions { shell } = cli.command {
        return shell_completion::print(shell);
    }

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = ProjectConfig::load(&cwd)?;
    match config_path {
        Some(ref p) => debug!("loaded config from {}", p.display()),
        None => debug!("no .warden/config.toml found, using defaults"),
    }
    let (root, paths) = project_paths(&config, config_path.as_deref(), &cwd);

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    let app = App {
        config,
        config_path,
        root,
        paths,
        stop,
        verbose: cli.verbose,
    };

    match cli.command {
        Command::Session { action } => run_session(&app, action)?,
        Command::Nudge { session, message } => {
            let message = read_message(&message)?;
            let controller = DeliveryController::new(app.mux(), app.config.nudge.clone());
            let report = controller
                .send(&session, &message, &app.stop)
                .with_context(|| format!("failed to nudge '{session}'"))?;
            println!("delivered {} bytes to {}", report.bytes, report.session);
        }
        Command::Witness { action } => run_witness(&app, action)?,
        Command::Config { json } => {
            let path = app.config_path.as_deref();
            if json {
                println!("{}", render::render_json(&app.config, path, &app.root)?);
            } else {
                print!("{}", render::render_human(&app.config, path, &app.root));
            }
        }
        Command::Completions { .. } => {}
    }

    Ok(())
}
