use crate::config::Target;
use crate::context::CallContext;
use crate::error::SshError;
use crate::session::{Connector, Session};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Cache of authenticated sessions keyed by `user@host:port`, plus the
/// sudo passwords entered for each key.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    keepalive_timeout: Duration,
    clients: Mutex<HashMap<String, Session>>,
    sudo: Mutex<HashMap<String, Zeroizing<String>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, keepalive_timeout: Duration) -> Self {
        Self {
            connector,
            keepalive_timeout,
            clients: Mutex::new(HashMap::new()),
            sudo: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a live session for `target`, dialing when the cache is empty
    /// or the cached session fails its keepalive.
    pub async fn get_client(&self, ctx: &CallContext, target: &Target) -> Result<Session, SshError> {
        let key = target.key();
        let cached = self.clients.lock().get(&key).cloned();

        if let Some(session) = cached {
            let probe = tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                res = tokio::time::timeout(self.keepalive_timeout, session.keepalive()) => res,
            };
            match probe {
                Ok(Ok(())) => return Ok(session),
                Ok(Err(err)) => warn!(target = %key, error = %err, "cached session is dead"),
                Err(_) => warn!(target = %key, "keepalive timed out"),
            }
            {
                let mut clients = self.clients.lock();
                if clients
                    .get(&key)
                    .is_some_and(|current| Arc::ptr_eq(current, &session))
                {
                    clients.remove(&key);
                }
            }
            self.close_bounded(ctx, &key, session).await;
        }

        if let Some(err) = ctx.err() {
            return Err(err);
        }
        info!(target = %key, "connecting");
        let session = self.connector.connect(ctx, target).await?;

        let existing = {
            let mut clients = self.clients.lock();
            match clients.get(&key) {
                Some(existing) => Some(existing.clone()),
                None => {
                    clients.insert(key.clone(), session.clone());
                    None
                }
            }
        };
        if let Some(existing) = existing {
            // Another caller connected first; keep theirs.
            self.close_bounded(ctx, &key, session).await;
            return Ok(existing);
        }
        info!(target = %key, "connected");
        Ok(session)
    }

    /// Closes a session no longer in the cache. A close that outlives the
    /// keepalive bound or the caller's context finishes in the background.
    async fn close_bounded(&self, ctx: &CallContext, key: &str, session: Session) {
        let mut close = Box::pin(async move { session.close().await });
        let finished = tokio::select! {
            biased;
            _ = &mut close => true,
            _ = ctx.done() => false,
            _ = tokio::time::sleep(self.keepalive_timeout) => false,
        };
        if !finished {
            warn!(target = %key, "closing stale session in the background");
            tokio::spawn(close);
        }
    }

    /// Disconnects every cached session. Used at shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<(String, Session)> = self.clients.lock().drain().collect();
        for (key, session) in sessions {
            info!(target = %key, "closing connection");
            session.close().await;
        }
    }

    pub fn cached_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn set_sudo_password(&self, target: &Target, password: Zeroizing<String>) {
        self.sudo.lock().insert(target.key(), password);
    }

    pub fn sudo_password(&self, target: &Target) -> Option<Zeroizing<String>> {
        self.sudo.lock().get(&target.key()).cloned()
    }

    pub fn clear_sudo_password(&self, target: &Target) {
        self.sudo.lock().remove(&target.key());
    }
}
