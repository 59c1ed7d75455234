use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "warden",
    about = "Supervise tmux-hosted agent workers: sessions, nudges and lifecycle cleanup",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, inspect and remove worker sessions
    Session {
        #[command(subcommand)]
        action: SessionCommand,
    },

    /// Deliver a message into a session and submit it
    Nudge {
        /// Target session name
        session: String,

        /// Message text, or "-" to read it from stdin
        message: String,
    },

    /// Control the per-rig witness
    Witness {
        #[command(subcommand)]
        action: WitnessCommand,
    },

    /// Show project configuration
    Config {
        /// Emit machine-readable JSON output
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print shell completions
    Completions {
        /// Target shell
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// Start a detached session running a command
    Create {
        /// Session name
        name: String,

        /// Working directory for the session
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// Wait until the command has replaced the shell
        #[arg(long, default_value_t = false)]
        wait: bool,

        /// Command to run; prefix with "exec " to replace the shell
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Kill a session (no error when it is already gone)
    Kill { name: String },

    /// Show what a session is running
    Status {
        name: String,

        /// Emit machine-readable JSON output
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Wait until a session's foreground command is not a shell
    Wait {
        name: String,

        /// Give up after this many seconds (default from config)
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
pub enum WitnessCommand {
    /// Start the witness (detached unless --foreground)
    Start {
        /// Run the loop in this process
        #[arg(long, default_value_t = false)]
        foreground: bool,
    },

    /// Stop a running witness
    Stop,

    /// Show witness state
    Status {
        /// Emit machine-readable JSON output
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Run the witness loop as the detached child
    #[command(hide = true)]
    Run,

    /// Tear down one worker now
    Cleanup { worker: String },

    /// Queue a shutdown request in the witness mailbox
    RequestShutdown {
        worker: String,

        /// Sender recorded on the message
        #[arg(long, default_value = "cli")]
        from: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

impl SessionCommand {
    /// Launch command as a single shell string.
    pub fn joined_command(command: &[String]) -> String {
        command.join(" ")
    }
}
