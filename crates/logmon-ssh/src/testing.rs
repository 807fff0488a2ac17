//! In-memory sessions for exercising the pool, tailer and coordinator without a network.

use crate::config::Target;
use crate::context::CallContext;
use crate::error::SshError;
use crate::session::{ChannelEvent, Connector, RemoteChannel, RemoteSession, Session, Signal};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub type Responder = Arc<dyn Fn(&str) -> Script + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum End {
    Close,
    Hang,
}

/// What a mock channel emits for one command.
pub struct Script {
    events: VecDeque<ChannelEvent>,
    live: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    end: End,
    hang_on_signal: bool,
}

/// Pushes events into a streaming [`Script`]. Dropping it ends the stream.
#[derive(Clone)]
pub struct Feed {
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl Feed {
    pub fn line(&self, text: &str) {
        let _ = self
            .tx
            .send(ChannelEvent::Stdout(Bytes::copy_from_slice(text.as_bytes())));
    }

    pub fn send(&self, event: ChannelEvent) {
        let _ = self.tx.send(event);
    }
}

impl Script {
    pub fn events(events: Vec<ChannelEvent>) -> Self {
        Self {
            events: events.into(),
            live: None,
            end: End::Close,
            hang_on_signal: false,
        }
    }

    pub fn exit(mut events: Vec<ChannelEvent>, code: u32) -> Self {
        events.push(ChannelEvent::Exit(code));
        Self::events(events)
    }

    pub fn stdout(text: &str) -> Self {
        Self::exit(
            vec![ChannelEvent::Stdout(Bytes::copy_from_slice(text.as_bytes()))],
            0,
        )
    }

    /// A script fed at runtime; after the feed is dropped the channel closes.
    pub fn stream() -> (Self, Feed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut script = Self::events(Vec::new());
        script.live = Some(rx);
        (script, Feed { tx })
    }

    /// Never closes on its own after the scripted events.
    pub fn hang(mut self) -> Self {
        self.end = End::Hang;
        self
    }

    /// Signalling the channel blocks forever, like a wedged remote.
    pub fn hang_on_signal(mut self) -> Self {
        self.hang_on_signal = true;
        self
    }
}

/// Everything a channel saw from the caller.
#[derive(Debug, Default)]
pub struct ChannelRecord {
    stdin: Mutex<Vec<u8>>,
    stdin_closed: AtomicBool,
    signals: Mutex<Vec<Signal>>,
    closed: AtomicBool,
}

impl ChannelRecord {
    pub fn stdin(&self) -> Vec<u8> {
        self.stdin.lock().clone()
    }

    pub fn stdin_closed(&self) -> bool {
        self.stdin_closed.load(Ordering::SeqCst)
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().clone()
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MockChannel {
    script: Script,
    record: Arc<ChannelRecord>,
}

#[async_trait]
impl RemoteChannel for MockChannel {
    async fn write_stdin(&mut self, data: &[u8]) -> Result<(), SshError> {
        self.record.stdin.lock().extend_from_slice(data);
        Ok(())
    }

    async fn close_stdin(&mut self) -> Result<(), SshError> {
        self.record.stdin_closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if let Some(event) = self.script.events.pop_front() {
            return Some(event);
        }
        if let Some(live) = self.script.live.as_mut() {
            match live.recv().await {
                Some(event) => return Some(event),
                None => self.script.live = None,
            }
        }
        match self.script.end {
            End::Close => None,
            End::Hang => std::future::pending().await,
        }
    }

    async fn signal(&mut self, signal: Signal) -> Result<(), SshError> {
        self.record.signals.lock().push(signal);
        if self.script.hang_on_signal {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SshError> {
        self.record.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn default_responder() -> Responder {
    Arc::new(|_| Script::exit(Vec::new(), 0))
}

/// A session whose commands are answered by a responder function.
pub struct MockSession {
    key: String,
    alive: AtomicBool,
    keepalive_hangs: AtomicBool,
    close_hangs: AtomicBool,
    closes: AtomicUsize,
    commands: Mutex<Vec<String>>,
    channels: Mutex<Vec<Arc<ChannelRecord>>>,
    responder: Mutex<Responder>,
}

impl MockSession {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            alive: AtomicBool::new(true),
            keepalive_hangs: AtomicBool::new(false),
            close_hangs: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            responder: Mutex::new(default_responder()),
        }
    }

    pub fn with_responder(self, responder: impl Fn(&str) -> Script + Send + Sync + 'static) -> Self {
        *self.responder.lock() = Arc::new(responder);
        self
    }

    fn with_shared_responder(self, responder: Responder) -> Self {
        *self.responder.lock() = responder;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn set_responder(&self, responder: impl Fn(&str) -> Script + Send + Sync + 'static) {
        *self.responder.lock() = Arc::new(responder);
    }

    /// Simulates a dropped connection: keepalives and new commands fail.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn hang_keepalive(&self) {
        self.keepalive_hangs.store(true, Ordering::SeqCst);
    }

    /// `close` is counted, then never returns.
    pub fn hang_close(&self) {
        self.close_hangs.store(true, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn last_channel(&self) -> Option<Arc<ChannelRecord>> {
        self.channels.lock().last().cloned()
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn keepalive(&self) -> Result<(), SshError> {
        if self.keepalive_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SshError::Channel("connection lost".to_string()))
        }
    }

    async fn exec(&self, command: &str) -> Result<Box<dyn RemoteChannel>, SshError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SshError::Channel("connection lost".to_string()));
        }
        self.commands.lock().push(command.to_string());
        let responder = self.responder.lock().clone();
        let record = Arc::new(ChannelRecord::default());
        self.channels.lock().push(record.clone());
        Ok(Box::new(MockChannel {
            script: responder(command),
            record,
        }))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        if self.close_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

/// Hands out [`MockSession`]s and records every dial.
pub struct MockConnector {
    dials: AtomicUsize,
    delays: Mutex<HashMap<String, Duration>>,
    failures: Mutex<HashMap<String, SshError>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    responder: Mutex<Responder>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            dials: AtomicUsize::new(0),
            delays: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            sessions: Mutex::new(Vec::new()),
            responder: Mutex::new(default_responder()),
        }
    }

    /// Responder installed on every session dialed from now on.
    pub fn with_responder(self, responder: impl Fn(&str) -> Script + Send + Sync + 'static) -> Self {
        *self.responder.lock() = Arc::new(responder);
        self
    }

    pub fn set_responder(&self, responder: impl Fn(&str) -> Script + Send + Sync + 'static) {
        *self.responder.lock() = Arc::new(responder);
    }

    /// Dials to `host` take `delay` (interruptible by the call context).
    pub fn set_delay(&self, host: &str, delay: Duration) {
        self.delays.lock().insert(host.to_string(), delay);
    }

    pub fn fail(&self, host: &str, err: SshError) {
        self.failures.lock().insert(host.to_string(), err);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, ctx: &CallContext, target: &Target) -> Result<Session, SshError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().get(&target.host).copied();
        if let Some(delay) = delay {
            ctx.run(async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
        }
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let failure = self.failures.lock().get(&target.host).cloned();
        if let Some(err) = failure {
            return Err(err);
        }
        let responder = self.responder.lock().clone();
        let session = Arc::new(MockSession::new(target.key()).with_shared_responder(responder));
        self.sessions.lock().push(session.clone());
        let session: Session = session;
        Ok(session)
    }
}
