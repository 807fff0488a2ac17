use crate::error::SshError;
use crate::exec::{is_sudo_failure, shell_quote, start, CommandOpts};
use crate::session::{ChannelEvent, RemoteChannel, RemoteSession, Signal};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STDERR_LIMIT: usize = 4096;

/// Invoked once when a tail ends without being stopped.
pub type ErrCallback = Box<dyn FnOnce(SshError) + Send>;

/// Destination for streamed output.
#[async_trait]
pub trait TailSink: Send {
    async fn write(&mut self, data: Bytes) -> Result<(), SshError>;
}

/// Adapts any async writer into a [`TailSink`].
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> TailSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: Bytes) -> Result<(), SshError> {
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

enum CallbackSlot {
    Empty,
    Registered(ErrCallback),
    Fired,
}

struct TailState {
    err: Option<SshError>,
    callback: CallbackSlot,
}

/// Handle to one running `tail -f`.
pub struct Tailer {
    path: String,
    cancel: CancellationToken,
    done: CancellationToken,
    state: Arc<Mutex<TailState>>,
}

/// Starts `tail -n <lines> -f <path>` and copies its output to `sink` until
/// the tailer is stopped, `parent` is cancelled or the stream ends.
pub async fn start_tail(
    parent: &CancellationToken,
    session: &dyn RemoteSession,
    path: &str,
    lines: u32,
    sink: Box<dyn TailSink>,
    opts: &CommandOpts,
) -> Result<Tailer, SshError> {
    let command = format!("tail -n {lines} -f {}", shell_quote(path));
    let channel = start(session, &command, opts).await?;
    info!(path, lines, sudo = opts.is_sudo(), "tail started");

    let tailer = Tailer {
        path: path.to_string(),
        cancel: parent.child_token(),
        done: CancellationToken::new(),
        state: Arc::new(Mutex::new(TailState {
            err: None,
            callback: CallbackSlot::Empty,
        })),
    };

    let cancel = tailer.cancel.clone();
    let state = tailer.state.clone();
    let done = tailer.done.clone();
    let sudo = opts.is_sudo();
    let path = tailer.path.clone();
    tokio::spawn(async move {
        let _done = done.drop_guard();
        match copy_loop(channel, sink, &cancel, sudo, &command).await {
            None => debug!(path = %path, "tail stopped"),
            Some(err) => {
                warn!(path = %path, error = %err, "tail ended");
                finish(&state, err);
            }
        }
    });
    Ok(tailer)
}

fn finish(state: &Mutex<TailState>, err: SshError) {
    let callback = {
        let mut state = state.lock();
        state.err = Some(err.clone());
        match std::mem::replace(&mut state.callback, CallbackSlot::Empty) {
            CallbackSlot::Registered(cb) => {
                state.callback = CallbackSlot::Fired;
                Some(cb)
            }
            other => {
                state.callback = other;
                None
            }
        }
    };
    if let Some(cb) = callback {
        cb(err);
    }
}

/// `None` when stopped by cancellation, otherwise why the stream ended.
async fn copy_loop(
    mut channel: Box<dyn RemoteChannel>,
    mut sink: Box<dyn TailSink>,
    cancel: &CancellationToken,
    sudo: bool,
    command: &str,
) -> Option<SshError> {
    let mut stderr = Vec::new();
    let mut status = None;
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate(channel.as_mut()).await;
                return None;
            }
            event = channel.next_event() => event,
        };
        match event {
            Some(ChannelEvent::Stdout(data)) => {
                let written = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        terminate(channel.as_mut()).await;
                        return None;
                    }
                    res = sink.write(data) => res,
                };
                if let Err(err) = written {
                    let _ = channel.close().await;
                    return Some(err);
                }
            }
            Some(ChannelEvent::Stderr(data)) => {
                let room = STDERR_LIMIT.saturating_sub(stderr.len());
                stderr.extend_from_slice(&data[..data.len().min(room)]);
            }
            Some(ChannelEvent::Exit(code)) => status = Some(code),
            Some(ChannelEvent::Signaled(name)) => debug!(signal = %name, "tail killed by signal"),
            None => break,
        }
    }

    let stderr = String::from_utf8_lossy(&stderr);
    if sudo && is_sudo_failure(&stderr) {
        return Some(SshError::SudoAuthFailed);
    }
    match status {
        Some(code) if code != 0 => Some(SshError::CommandFailed {
            command: command.to_string(),
            status,
            output: stderr.trim_end().to_string(),
        }),
        _ => Some(SshError::StreamEnded),
    }
}

async fn terminate(channel: &mut dyn RemoteChannel) {
    if let Err(err) = channel.signal(Signal::Term).await {
        debug!(error = %err, "signalling tail failed");
    }
    if let Err(err) = channel.close().await {
        debug!(error = %err, "closing tail channel failed");
    }
}

impl Tailer {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Cancels without waiting for the copy loop.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        self.done.cancelled().await;
    }

    /// Cancels and waits at most `timeout`. Returns whether the loop finished.
    pub async fn await_stop(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        tokio::time::timeout(timeout, self.done.cancelled())
            .await
            .is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Registers the callback for an unrequested end of stream. If the stream
    /// already ended it runs immediately. Fires at most once per tailer.
    pub fn set_err_callback(&self, callback: ErrCallback) {
        let mut state = self.state.lock();
        if matches!(state.callback, CallbackSlot::Fired) {
            return;
        }
        match state.err.clone() {
            Some(err) => {
                state.callback = CallbackSlot::Fired;
                drop(state);
                callback(err);
            }
            None => state.callback = CallbackSlot::Registered(callback),
        }
    }

    pub fn err(&self) -> Option<SshError> {
        self.state.lock().err.clone()
    }
}
