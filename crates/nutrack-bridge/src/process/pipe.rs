//! Host side of the stdio pipe.
//!
//! A [`PipeConnection`] owns two background tasks over any byte-stream pair:
//! one writer that serializes outgoing frames a whole line at a time, and one
//! reader that decodes incoming lines and routes them. Responses go to the
//! [`PendingTable`] and pushes go to a broadcast fan-out.
//!
//! The supervisor attaches it to a child's stdin/stdout. Tests attach it to
//! in-memory duplex streams.

use crate::config::PipeConfig;
use crate::error::{BridgeError, Result};
use crate::pending::PendingTable;
use crate::protocol::{encode, FrameReader, FramedMessage};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct PipeShared {
    open: AtomicBool,
    pending: Arc<PendingTable>,
    push_tx: broadcast::Sender<Value>,
    closed_tx: watch::Sender<bool>,
}

impl PipeShared {
    /// Mark the pipe closed and fail everything still waiting on it.
    fn close(&self, code: Option<i32>) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("Pipe closed");
        }
        self.closed_tx.send_replace(true);
        self.pending
            .fail_all(|| BridgeError::ChildProcessExited { code });
    }
}

/// Handle to a live pipe connection.
pub struct PipeConnection {
    shared: Arc<PipeShared>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl PipeConnection {
    /// Wire a writer (the child's stdin) and a reader (its stdout).
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (push_tx, _) = broadcast::channel(PipeConfig::PUSH_BUFFER);
        let shared = Arc::new(PipeShared {
            open: AtomicBool::new(true),
            pending: PendingTable::new(),
            push_tx,
            closed_tx: watch::channel(false).0,
        });

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(Self::writer_loop(writer, outbound_rx, shared.clone()));
        let reader_task = tokio::spawn(Self::reader_loop(reader, shared.clone()));

        Self {
            shared,
            outbound,
            writer_task,
            reader_task,
        }
    }

    async fn writer_loop<W: AsyncWrite + Unpin>(
        mut writer: W,
        mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        shared: Arc<PipeShared>,
    ) {
        while let Some(line) = outbound_rx.recv().await {
            let written = async {
                writer.write_all(&line).await?;
                writer.flush().await
            }
            .await;

            if let Err(e) = written {
                error!("Failed to write to backend stdin: {}", e);
                shared.close(None);
                break;
            }
        }
        debug!("Pipe writer stopped");
    }

    async fn reader_loop<R: AsyncRead + Unpin>(reader: R, shared: Arc<PipeShared>) {
        let mut frames = FrameReader::new(reader);

        loop {
            match frames.next_frame().await {
                Ok(Some(frame)) => Self::route(frame, &shared),
                Ok(None) => {
                    info!("Backend stdout closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read backend stdout: {}", e);
                    break;
                }
            }
        }

        shared.close(None);
    }

    fn route(frame: FramedMessage, shared: &PipeShared) {
        match frame {
            FramedMessage::Response(response) => {
                let id = response.request_id.clone();
                debug!("Response for request {}", id);
                shared.pending.resolve(&id, response.into_result());
            }
            FramedMessage::PushEvent(push) => {
                debug!("Push event from backend: {}", push.data);
                // No listeners is fine; pushes are fire-and-forget.
                let _ = shared.push_tx.send(push.data);
            }
            FramedMessage::Request(request) => {
                warn!(
                    "Ignoring request frame {} sent by the backend",
                    request.request_id
                );
            }
        }
    }

    /// Write one frame. Fails fast when the pipe is closed.
    pub fn send(&self, frame: &FramedMessage) -> Result<()> {
        if !self.is_open() {
            return Err(BridgeError::TransportUnavailable {
                reason: "backend pipe is closed".to_string(),
            });
        }

        let line = encode(frame)?;
        self.outbound
            .send(line)
            .map_err(|_| BridgeError::TransportUnavailable {
                reason: "backend pipe writer stopped".to_string(),
            })
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.shared.pending
    }

    /// Receive every push event the backend emits from now on.
    pub fn subscribe_push(&self) -> broadcast::Receiver<Value> {
        self.shared.push_tx.subscribe()
    }

    /// Flips to `true` once the pipe has closed.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shared.closed_tx.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Mark the pipe closed after the child exited with `code`.
    pub(crate) fn mark_exited(&self, code: Option<i32>) {
        self.shared.close(code);
    }
}

impl Drop for PipeConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl std::fmt::Debug for PipeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeConnection")
            .field("open", &self.is_open())
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}
