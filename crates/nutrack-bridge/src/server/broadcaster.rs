//! Backend-side push broadcasting.
//!
//! The backend announces changes without knowing which transport the host
//! picked: the stdio broadcaster writes `push-event` frames next to the
//! responses, the SSE broadcaster fans out to connected event-stream
//! clients.

use crate::config::PushConfig;
use crate::protocol::FramedMessage;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

pub trait Broadcaster: Send + Sync + 'static {
    fn broadcast(&self, message: Value);
}

/// Work item for the single stdout writer.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(FramedMessage),
    /// Signalled once everything queued before it has been written.
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle to the serialized frame writer.
#[derive(Debug, Clone)]
pub struct FrameSink {
    pub(crate) tx: mpsc::UnboundedSender<Outbound>,
}

impl FrameSink {
    /// Queue a frame; returns `false` if the writer has stopped.
    pub fn send(&self, frame: FramedMessage) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    /// Wait until every frame queued so far is written.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Outbound::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Push events as frames on the backend's stdout.
#[derive(Debug, Clone)]
pub struct StdioBroadcaster {
    sink: FrameSink,
}

impl StdioBroadcaster {
    pub fn new(sink: FrameSink) -> Self {
        Self { sink }
    }
}

impl Broadcaster for StdioBroadcaster {
    fn broadcast(&self, message: Value) {
        debug!("Broadcasting over stdio: {}", message);
        if !self.sink.send(FramedMessage::push(message)) {
            warn!("Stdout writer stopped, push event dropped");
        }
    }
}

/// Push events to every connected SSE client.
///
/// Each client reads from its own broadcast receiver; a client that falls
/// more than the buffer behind loses the overflow.
#[derive(Debug, Clone)]
pub struct SseBroadcaster {
    tx: broadcast::Sender<String>,
}

impl Default for SseBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl SseBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(PushConfig::SSE_CLIENT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Register a new SSE client.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// SSE `data` text for a push payload: strings go out verbatim.
pub fn sse_data(message: &Value) -> String {
    match message {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Broadcaster for SseBroadcaster {
    fn broadcast(&self, message: Value) {
        let data = sse_data(&message);
        match self.tx.send(data) {
            Ok(clients) => debug!("Broadcast {} to {} SSE clients", message, clients),
            Err(_) => debug!("No SSE clients for {}", message),
        }
    }
}
