use thiserror::Error;

/// Errors from the session, command and streaming layer.
///
/// Payloads are flattened to strings so the error can be cloned into tail
/// callbacks and UI messages.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SshError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out")]
    DeadlineExceeded,
    #[error("TCP dial {addr}: {message}")]
    Dial { addr: String, message: String },
    #[error("SSH handshake {addr}: {message}")]
    Handshake { addr: String, message: String },
    #[error("auth setup for {host}: {message}")]
    AuthConfig { host: String, message: String },
    #[error("authentication rejected for {user}@{host}")]
    AuthRejected { user: String, host: String },
    #[error("channel error: {0}")]
    Channel(String),
    #[error("sudo authentication failed")]
    SudoAuthFailed,
    #[error("running {command:?}: {}: {output}", exit_label(.status))]
    CommandFailed {
        command: String,
        status: Option<u32>,
        output: String,
    },
    #[error("unexpected output: {0}")]
    Parse(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("remote stream ended")]
    StreamEnded,
}

fn exit_label(status: &Option<u32>) -> String {
    match status {
        Some(code) => format!("exit status {code}"),
        None => "no exit status".to_string(),
    }
}

impl SshError {
    /// Cancellation means the work was superseded; callers drop it silently.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SshError::Cancelled)
    }

    pub fn is_sudo_auth_failure(&self) -> bool {
        matches!(self, SshError::SudoAuthFailed)
    }

    pub(crate) fn channel(err: impl std::fmt::Display) -> Self {
        SshError::Channel(err.to_string())
    }
}

impl From<std::io::Error> for SshError {
    fn from(err: std::io::Error) -> Self {
        SshError::Io(err.to_string())
    }
}
