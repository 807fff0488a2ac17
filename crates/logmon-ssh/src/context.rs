use crate::error::SshError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token coupled with an optional deadline.
///
/// Cloning shares the token, so cancelling any clone cancels the call.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A context cancelled together with `self` whose deadline is the earlier of the two.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(own, |d| d.min(own))),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `Some` once the context is cancelled or past its deadline.
    pub fn err(&self) -> Option<SshError> {
        if self.token.is_cancelled() {
            return Some(SshError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(SshError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or the deadline passes.
    pub async fn done(&self) -> SshError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => SshError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => SshError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                SshError::Cancelled
            }
        }
    }

    /// Runs `fut` until it completes or the context ends, whichever is first.
    /// On the losing side `fut` is dropped.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, SshError>
    where
        F: Future<Output = Result<T, SshError>>,
    {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }
}
