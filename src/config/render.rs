//! `warden config` output.

use std::fmt::Display;
use std::path::Path;

use anyhow::{Context, Result};

use super::{MailboxKind, ProjectConfig};

fn source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .warden/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl Display) {
    output.push_str(&format!("  {key:<22} {value}\n"));
}

fn list(values: &[String]) -> String {
    if values.is_empty() {
        "(none)".to_string()
    } else {
        values.join(", ")
    }
}

fn mailbox_kind_label(kind: MailboxKind) -> &'static str {
    match kind {
        MailboxKind::Maildir => "maildir",
        MailboxKind::Command => "command",
    }
}

/// Grouped, human-readable rendering. `project_root` resolves the rig name
/// and mailbox identity defaults.
pub fn render_human(config: &ProjectConfig, config_path: Option<&Path>, project_root: &Path) -> String {
    let mut output = String::new();

    output.push_str("Tmux\n");
    push_kv(
        &mut output,
        "socket",
        config.tmux.socket.as_deref().unwrap_or("(default server)"),
    );
    push_kv(
        &mut output,
        "command_timeout",
        format!("{}s", config.tmux.command_timeout_secs),
    );
    output.push('\n');

    output.push_str("Session\n");
    push_kv(&mut output, "shells", list(&config.session.shells));
    push_kv(
        &mut output,
        "startup_grace",
        format!("{}ms", config.session.startup_grace_millis),
    );
    push_kv(&mut output, "capture_lines", config.session.capture_lines);
    push_kv(
        &mut output,
        "size",
        format!("{}x{}", config.session.width, config.session.height),
    );
    output.push('\n');

    output.push_str("Readiness\n");
    push_kv(
        &mut output,
        "poll_interval",
        format!("{}ms", config.readiness.poll_interval_millis),
    );
    push_kv(
        &mut output,
        "timeout",
        format!("{}s", config.readiness.timeout_secs),
    );
    output.push('\n');

    output.push_str("Nudge\n");
    push_kv(
        &mut output,
        "lock_timeout",
        format!("{}s", config.nudge.lock_timeout_secs),
    );
    push_kv(
        &mut output,
        "settle",
        format!("{}ms", config.nudge.settle_millis),
    );
    push_kv(
        &mut output,
        "escape_before_submit",
        config.nudge.escape_before_submit,
    );
    push_kv(
        &mut output,
        "literal_limit",
        format!("{} bytes", config.nudge.literal_limit_bytes),
    );
    push_kv(
        &mut output,
        "chunk_size",
        format!("{} bytes", config.nudge.chunk_bytes),
    );
    push_kv(
        &mut output,
        "max_message",
        format!("{} bytes", config.nudge.max_message_bytes),
    );
    output.push('\n');

    output.push_str("Witness\n");
    push_kv(&mut output, "rig", config.rig_name(project_root));
    push_kv(
        &mut output,
        "interval",
        format!("{}s", config.witness.interval_secs),
    );
    push_kv(
        &mut output,
        "command_timeout",
        format!("{}s", config.witness.command_timeout_secs),
    );
    push_kv(&mut output, "session_prefix", &config.witness.session_prefix);
    output.push('\n');

    output.push_str("Workspace\n");
    push_kv(&mut output, "root", config.workspace.root.display());
    push_kv(&mut output, "repo", config.workspace.repo.display());
    push_kv(&mut output, "branch_prefix", &config.workspace.branch_prefix);
    output.push('\n');

    output.push_str("Mailbox\n");
    push_kv(&mut output, "kind", mailbox_kind_label(config.mailbox.kind));
    if config.mailbox.kind == MailboxKind::Command {
        push_kv(&mut output, "program", &config.mailbox.program);
        push_kv(&mut output, "inbox_args", list(&config.mailbox.inbox_args));
        push_kv(&mut output, "ack_args", list(&config.mailbox.ack_args));
    }
    push_kv(&mut output, "identity", config.mailbox_identity(project_root));
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", source_label(config_path));

    output
}

/// Effective configuration as pretty JSON, with resolved defaults and the
/// source path added.
pub fn render_json(config: &ProjectConfig, config_path: Option<&Path>, project_root: &Path) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    if let Some(obj) = payload.as_object_mut() {
        if let Some(witness) = obj.get_mut("witness").and_then(|w| w.as_object_mut()) {
            witness.insert("rig".into(), config.rig_name(project_root).into());
        }
        if let Some(mailbox) = obj.get_mut("mailbox").and_then(|m| m.as_object_mut()) {
            mailbox.insert(
                "identity".into(),
                config.mailbox_identity(project_root).into(),
            );
        }
        obj.insert("source_path".into(), source_label(config_path).into());
    }
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}
