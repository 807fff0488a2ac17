use bytes::Bytes;
use logmon_config::LogFolder;
use logmon_ssh::FileEntry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Where the presentation layer should put focus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pane {
    Servers,
    Folders,
    Files,
    Viewer,
}

/// Everything the core tells the presentation layer.
#[derive(Clone, Debug)]
pub enum Update {
    Folders {
        server: String,
        folders: Vec<LogFolder>,
    },
    Connecting {
        server: String,
        folder: String,
    },
    Files {
        server: String,
        folder: String,
        files: Vec<FileEntry>,
    },
    SudoPrompt {
        server: String,
        retry: bool,
    },
    FileContent {
        file: String,
        content: String,
    },
    TailData {
        file: String,
        data: Bytes,
    },
    TailEnded {
        file: String,
        message: String,
    },
    Status(String),
    Focus(Pane),
    Error {
        message: String,
        focus: Pane,
    },
}

struct Envelope {
    update: Update,
    // Held while tail output sits in the queue; released when it is received.
    _slot: Option<OwnedSemaphorePermit>,
}

/// Receiving end of an [`UpdateDispatcher`]. Updates arrive in submission order.
pub struct UpdateReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl UpdateReceiver {
    pub async fn recv(&mut self) -> Option<Update> {
        self.rx.recv().await.map(|envelope| envelope.update)
    }

    pub fn try_recv(&mut self) -> Result<Update, TryRecvError> {
        self.rx.try_recv().map(|envelope| envelope.update)
    }
}

/// Queue from background tasks to the single presentation loop.
///
/// Tail output is bounded to `capacity` queued chunks. Every other update is
/// always queued, so results and prompts are never lost while the queue is
/// busy with output. Once shut down every send is dropped.
#[derive(Clone, Debug)]
pub struct UpdateDispatcher {
    sender: mpsc::UnboundedSender<Envelope>,
    output_slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl UpdateDispatcher {
    pub fn new(capacity: usize) -> (Self, UpdateReceiver) {
        let (sender, rx) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                output_slots: Arc::new(Semaphore::new(capacity.max(1))),
                shutdown: CancellationToken::new(),
            },
            UpdateReceiver { rx },
        )
    }

    /// Never waits. Returns false when the update was dropped: after shutdown,
    /// or for tail output when its share of the queue is full.
    pub fn submit(&self, update: Update) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let slot = if matches!(update, Update::TailData { .. }) {
            match self.output_slots.clone().try_acquire_owned() {
                Ok(slot) => Some(slot),
                Err(_) => {
                    debug!("output queue full, dropping tail data");
                    return false;
                }
            }
        } else {
            None
        };
        self.send(update, slot)
    }

    /// Waits for room for tail output, but gives up as soon as the dispatcher shuts down.
    pub async fn deliver(&self, update: Update) -> bool {
        if !matches!(update, Update::TailData { .. }) {
            return self.submit(update);
        }
        let slot = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return false,
            slot = self.output_slots.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => return false,
            },
        };
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.send(update, Some(slot))
    }

    fn send(&self, update: Update, slot: Option<OwnedSemaphorePermit>) -> bool {
        self.sender
            .send(Envelope {
                update,
                _slot: slot,
            })
            .is_ok()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
