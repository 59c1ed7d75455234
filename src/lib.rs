//! Warden: supervise tmux-hosted agent workers.
//!
//! Three pieces sit on top of a [`tmux::Multiplexer`]:
//!
//! - [`session`] and [`readiness`] create worker sessions that fail loudly
//!   when the launch command dies, and wait until the worker replaced its shell.
//! - [`nudge`] delivers text into a session, serialized per session and
//!   submitted as a single input.
//! - [`witness`] is the per-rig health loop that tears workers down on
//!   request from its mailbox.

pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod log;
pub mod mailbox;
pub mod nudge;
pub mod paths;
pub mod probe;
pub mod process;
pub mod readiness;
pub mod session;
pub mod shell_completion;
pub mod tmux;
pub mod witness;
pub mod worktree;
