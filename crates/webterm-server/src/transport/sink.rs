//! Serialized outbound path to one browser socket.
//!
//! Every producer (the session's own read loop, a parent's fan-out, registry
//! notices) sends through a cloneable [`ClientSink`]; a single writer task owns
//! the socket and drains the queue in order. The queue is bounded: producers
//! either wait for room ([`ClientSink::send_wait`]) or find out it is full
//! ([`ClientSink::offer`]) and decide what to do about a slow browser.

use futures_util::{Sink, SinkExt};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webterm_core::{encode_server, ServerMessage};

/// Frames a socket may have queued before producers see it as full.
pub const SINK_CAPACITY: usize = 4096;

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// Command queued for a socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCommand {
    Frame(ServerMessage),
    /// Flush what is queued, send a close frame, stop.
    Close,
}

/// Result of a non-blocking send.
#[derive(Debug, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// The queue is full; the frame is handed back.
    Full(ServerMessage),
    /// The writer is gone.
    Gone,
}

/// Cloneable handle to a socket writer.
#[derive(Debug, Clone)]
pub struct ClientSink {
    id: u64,
    tx: mpsc::Sender<SinkCommand>,
    abandon: CancellationToken,
}

impl ClientSink {
    /// A sink whose queue is drained by the caller.
    pub fn channel() -> (Self, mpsc::Receiver<SinkCommand>) {
        Self::with_capacity(SINK_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<SinkCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed);
        let sink = Self {
            id,
            tx,
            abandon: CancellationToken::new(),
        };
        (sink, rx)
    }

    /// Spawn a writer task over `ws` and return its handle.
    pub fn spawn<S>(ws: S) -> Self
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: std::fmt::Display,
    {
        let (sink, rx) = Self::channel();
        tokio::spawn(run_writer(sink.id, ws, rx, sink.abandon.clone()));
        sink
    }

    /// Queue a frame without waiting.
    pub fn offer(&self, msg: ServerMessage) -> Offer {
        match self.tx.try_send(SinkCommand::Frame(msg)) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(SinkCommand::Frame(msg))) => Offer::Full(msg),
            Err(_) => Offer::Gone,
        }
    }

    /// Queue a frame, dropping it if the socket is backed up. Returns whether
    /// it was queued.
    pub fn send(&self, msg: ServerMessage) -> bool {
        match self.offer(msg) {
            Offer::Queued => true,
            Offer::Full(_) => {
                debug!(sink = self.id, "socket queue full, frame dropped");
                false
            }
            Offer::Gone => false,
        }
    }

    /// Queue a frame, waiting for room. Returns false once the writer is
    /// gone or the sink has been abandoned.
    pub async fn send_wait(&self, msg: ServerMessage) -> bool {
        tokio::select! {
            sent = self.tx.send(SinkCommand::Frame(msg)) => sent.is_ok(),
            _ = self.abandon.cancelled() => false,
        }
    }

    /// Queue a CR/LF wrapped notice line.
    pub fn notice(&self, text: &str) -> bool {
        self.send(ServerMessage::notice(text))
    }

    /// Queue a close; frames queued before it are still delivered. A sink
    /// too backed up to take the close is abandoned instead.
    pub fn close(&self) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(SinkCommand::Close) {
            debug!(sink = self.id, "socket queue full, abandoning writer");
            self.abandon.cancel();
        }
    }
}

async fn run_writer<S>(
    id: u64,
    mut ws: S,
    mut rx: mpsc::Receiver<SinkCommand>,
    abandon: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let cmd = tokio::select! {
            _ = abandon.cancelled() => break,
            cmd = rx.recv() => cmd,
        };
        match cmd {
            Some(SinkCommand::Frame(msg)) => {
                let text = encode_server(&msg);
                let sent = tokio::select! {
                    _ = abandon.cancelled() => break,
                    sent = ws.send(Message::Text(text.into())) => sent,
                };
                if let Err(e) = sent {
                    warn!(sink = id, error = %e, "WS send failed");
                    break;
                }
            }
            Some(SinkCommand::Close) => {
                let _ = ws.send(Message::Close(None)).await;
                break;
            }
            None => break,
        }
    }
    let _ = ws.close().await;
    debug!(sink = id, "socket writer stopped");
}
