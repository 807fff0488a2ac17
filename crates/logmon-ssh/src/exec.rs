use crate::error::SshError;
use crate::session::{ChannelEvent, RemoteChannel, RemoteSession};
use std::fmt;
use tracing::debug;
use zeroize::Zeroizing;

const SUDO_FAILURE_MARKERS: [&str; 2] = ["Sorry, try again", "incorrect password"];

/// Per-command options. A sudo password switches the command to `sudo -S`.
#[derive(Clone, Default)]
pub struct CommandOpts {
    pub sudo_password: Option<Zeroizing<String>>,
}

impl CommandOpts {
    pub fn sudo(password: Zeroizing<String>) -> Self {
        Self {
            sudo_password: Some(password),
        }
    }

    pub fn is_sudo(&self) -> bool {
        self.sudo_password.is_some()
    }
}

impl fmt::Debug for CommandOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandOpts")
            .field("sudo", &self.is_sudo())
            .finish()
    }
}

/// Single-quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ',' | ':' | '@' | '+' | '='))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

pub(crate) fn is_sudo_failure(stderr: &str) -> bool {
    SUDO_FAILURE_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
}

/// Opens a channel running `command`, feeding the sudo password when requested.
pub(crate) async fn start(
    session: &dyn RemoteSession,
    command: &str,
    opts: &CommandOpts,
) -> Result<Box<dyn RemoteChannel>, SshError> {
    match &opts.sudo_password {
        Some(password) => {
            debug!(command, "running with sudo");
            let mut channel = session.exec(&format!("sudo -S {command}")).await?;
            let mut line = Zeroizing::new(Vec::with_capacity(password.len() + 1));
            line.extend_from_slice(password.as_bytes());
            line.push(b'\n');
            channel
                .write_stdin(&line)
                .await
                .map_err(|e| SshError::Channel(format!("writing sudo password: {e}")))?;
            channel.close_stdin().await?;
            Ok(channel)
        }
        None => {
            debug!(command, "running");
            session.exec(command).await
        }
    }
}

/// Classifies how a finished command ended.
pub(crate) fn check_exit(
    command: &str,
    status: Option<u32>,
    stderr: &str,
    opts: &CommandOpts,
    output: impl FnOnce() -> String,
) -> Result<(), SshError> {
    if status == Some(0) {
        return Ok(());
    }
    if opts.is_sudo() && is_sudo_failure(stderr) {
        return Err(SshError::SudoAuthFailed);
    }
    Err(SshError::CommandFailed {
        command: command.to_string(),
        status,
        output: output().trim_end().to_string(),
    })
}

/// Runs `command` to completion and returns its output.
///
/// Without sudo stdout and stderr are interleaved as they arrive. With sudo
/// only stdout is returned; stderr carries the password prompt and is kept
/// for failure classification.
pub async fn run_command(
    session: &dyn RemoteSession,
    command: &str,
    opts: &CommandOpts,
) -> Result<String, SshError> {
    let mut channel = start(session, command, opts).await?;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut status = None;
    while let Some(event) = channel.next_event().await {
        match event {
            ChannelEvent::Stdout(data) => stdout.extend_from_slice(&data),
            ChannelEvent::Stderr(data) if opts.is_sudo() => stderr.extend_from_slice(&data),
            ChannelEvent::Stderr(data) => stdout.extend_from_slice(&data),
            ChannelEvent::Exit(code) => status = Some(code),
            ChannelEvent::Signaled(name) => {
                debug!(command, signal = %name, "remote command killed by signal")
            }
        }
    }

    let stderr = String::from_utf8_lossy(&stderr);
    let stdout = String::from_utf8_lossy(&stdout).into_owned();
    check_exit(command, status, &stderr, opts, || {
        if opts.is_sudo() {
            stderr.to_string()
        } else {
            stdout.clone()
        }
    })?;
    Ok(stdout)
}
