use logmon_ssh::SshError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Ssh(#[from] SshError),
    #[error("invalid data: {0}")]
    Invalid(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Ssh(err) if err.is_cancelled())
    }

    pub fn is_sudo_auth_failure(&self) -> bool {
        matches!(self, CoreError::Ssh(err) if err.is_sudo_auth_failure())
    }
}
