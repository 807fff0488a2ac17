use crate::config::Target;
use crate::context::CallContext;
use crate::error::SshError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Something read from a running remote command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit(u32),
    Signaled(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Term,
    Int,
    Kill,
}

/// One command running on its own channel.
#[async_trait]
pub trait RemoteChannel: Send {
    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), SshError>;

    async fn close_stdin(&mut self) -> Result<(), SshError>;

    /// `None` once the channel is closed, whether cleanly or because the
    /// connection broke. Cancel-safe.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    async fn signal(&mut self, signal: Signal) -> Result<(), SshError>;

    async fn close(&mut self) -> Result<(), SshError>;
}

/// An authenticated connection that can run many commands.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Lightweight liveness probe.
    async fn keepalive(&self) -> Result<(), SshError>;

    async fn exec(&self, command: &str) -> Result<Box<dyn RemoteChannel>, SshError>;

    async fn close(&self);
}

/// Sessions are shared: the pool owns the cache entry, callers borrow clones.
pub type Session = Arc<dyn RemoteSession>;

/// Dials and authenticates new sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, ctx: &CallContext, target: &Target) -> Result<Session, SshError>;
}
