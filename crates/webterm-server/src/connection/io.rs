//! Channel plumbing between a connection and its backend task.
//!
//! Every backend (PTY process, SSH channel, Telnet socket) runs as its own
//! task or thread and talks to the connection through a [`BackendIo`]: output
//! chunks flow up a bounded channel, input and control commands flow down an
//! unbounded one. The backend drops its command receiver when it dies, which
//! is what [`InputSender::is_alive`] observes.

use std::collections::VecDeque;
use tokio::sync::mpsc;
use webterm_core::{GatewayError, GatewayResult};

/// Output chunks buffered between a backend reader and the session.
const OUTPUT_QUEUE: usize = 64;

/// Command delivered to a backend task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCommand {
    Data(Vec<u8>),
    Resize { rows: u16, cols: u16 },
    Close,
}

/// Connection-side writer half.
#[derive(Debug, Clone)]
pub struct InputSender {
    tx: mpsc::UnboundedSender<BackendCommand>,
}

impl InputSender {
    pub fn send_data(&self, data: &[u8]) -> GatewayResult<()> {
        self.tx
            .send(BackendCommand::Data(data.to_vec()))
            .map_err(|_| GatewayError::NoBackend)
    }

    /// Submit a credential followed by a newline.
    pub fn submit_line(&self, line: &str) -> GatewayResult<()> {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.tx
            .send(BackendCommand::Data(data))
            .map_err(|_| GatewayError::NoBackend)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> GatewayResult<()> {
        self.tx
            .send(BackendCommand::Resize { rows, cols })
            .map_err(|_| GatewayError::NoBackend)
    }

    pub fn close(&self) {
        let _ = self.tx.send(BackendCommand::Close);
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Connection-side reader half.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::Receiver<Vec<u8>>,
    /// Bytes pulled from the channel but not yet consumed.
    pending: VecDeque<u8>,
}

impl OutputStream {
    /// Next chunk of output, `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if !self.pending.is_empty() {
            return Some(self.pending.drain(..).collect());
        }
        loop {
            let chunk = self.rx.recv().await?;
            if !chunk.is_empty() {
                return Some(chunk);
            }
        }
    }

    /// Next single byte, `None` at end of stream. Cancel-safe.
    pub async fn next_byte(&mut self) -> Option<u8> {
        while self.pending.is_empty() {
            let chunk = self.rx.recv().await?;
            self.pending.extend(chunk);
        }
        self.pending.pop_front()
    }
}

/// The connection's view of a running backend.
#[derive(Debug)]
pub struct BackendIo {
    pub output: OutputStream,
    pub input: InputSender,
}

/// The backend task's view of the same channels.
#[derive(Debug)]
pub struct BackendPeer {
    pub output: mpsc::Sender<Vec<u8>>,
    pub commands: mpsc::UnboundedReceiver<BackendCommand>,
}

impl BackendIo {
    /// Create both ends of a backend link.
    pub fn pair() -> (BackendIo, BackendPeer) {
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_QUEUE);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            BackendIo {
                output: OutputStream {
                    rx: out_rx,
                    pending: VecDeque::new(),
                },
                input: InputSender { tx: cmd_tx },
            },
            BackendPeer {
                output: out_tx,
                commands: cmd_rx,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bytes_then_chunks_share_pending() {
        let (mut io, peer) = BackendIo::pair();
        peer.output.send(b"abc".to_vec()).await.unwrap();
        assert_eq!(io.output.next_byte().await, Some(b'a'));
        assert_eq!(io.output.next_chunk().await, Some(b"bc".to_vec()));
        drop(peer);
        assert_eq!(io.output.next_chunk().await, None);
    }

    #[tokio::test]
    async fn liveness_follows_peer() {
        let (io, mut peer) = BackendIo::pair();
        assert!(io.input.is_alive());
        io.input.submit_line("user").unwrap();
        assert_eq!(
            peer.commands.recv().await,
            Some(BackendCommand::Data(b"user\n".to_vec()))
        );
        drop(peer);
        assert!(!io.input.is_alive());
        assert!(matches!(
            io.input.send_data(b"x"),
            Err(GatewayError::NoBackend)
        ));
    }
}
