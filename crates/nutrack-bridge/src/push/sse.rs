//! Push sources.
//!
//! A [`PushSource`] opens one stream of raw push payloads. The channel owns
//! the reconnect loop; sources only know how to open.

use crate::config::PushConfig;
use crate::error::{BridgeError, Result};
use crate::process::PipeConnection;
use async_trait::async_trait;
use bytes::BytesMut;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{header, Client};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Stream of push payloads; an `Err` item ends the connection.
pub type PushStream = BoxStream<'static, Result<Value>>;

#[async_trait]
pub trait PushSource: Send + Sync + 'static {
    /// Open a new stream. Fails if the remote end cannot be reached.
    async fn open(&self) -> Result<PushStream>;

    /// Whether a lost stream should be reopened.
    fn reconnects(&self) -> bool;

    fn describe(&self) -> String;
}

/// Server-sent events from `<base>/sse`.
#[derive(Debug, Clone)]
pub struct SseSource {
    client: Client,
    url: String,
}

impl SseSource {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), PushConfig::SSE_PATH),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PushSource for SseSource {
    async fn open(&self) -> Result<PushStream> {
        let response = self
            .client
            .get(&self.url)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| BridgeError::Network {
                message: format!("SSE connect to {} failed: {}", self.url, e),
                source: Some(e),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Remote {
                message: format!("SSE endpoint answered {}", status),
                status: Some(status.as_u16()),
                code: None,
            });
        }

        debug!("SSE stream open at {}", self.url);

        let state = (response.bytes_stream().boxed(), SseParser::default());
        let events = stream::unfold(state, |(mut bytes, mut parser)| async move {
            loop {
                if let Some(data) = parser.next_event() {
                    return Some((Ok(Value::String(data)), (bytes, parser)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => parser.push(&chunk),
                    Some(Err(e)) => {
                        let err = BridgeError::Network {
                            message: format!("SSE stream failed: {}", e),
                            source: Some(e),
                        };
                        return Some((Err(err), (bytes, parser)));
                    }
                    None => return None,
                }
            }
        });

        Ok(events.boxed())
    }

    fn reconnects(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("sse {}", self.url)
    }
}

/// Incremental `text/event-stream` parser.
///
/// Only `data:` fields matter; multi-line data is joined with `\n`, other
/// fields and comments are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    /// Raw bytes; only complete events are decoded, so a UTF-8 sequence
    /// split across chunks survives.
    buffer: BytesMut,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.contains(&b'\r') {
            self.normalize_line_endings();
        }
    }

    /// Rewrite `\r\n` as `\n`. A lone trailing `\r` waits for the next chunk.
    fn normalize_line_endings(&mut self) {
        let mut normalized = BytesMut::with_capacity(self.buffer.len());
        let mut bytes = self.buffer.iter().peekable();
        while let Some(&b) = bytes.next() {
            if b == b'\r' && bytes.peek() == Some(&&b'\n') {
                continue;
            }
            normalized.extend_from_slice(&[b]);
        }
        self.buffer = normalized;
    }

    /// Data of the next complete event, skipping events without data.
    pub fn next_event(&mut self) -> Option<String> {
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block = self.buffer.split_to(end + 2);
            let block = String::from_utf8_lossy(&block);

            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(|d| d.strip_prefix(' ').unwrap_or(d))
                .collect();

            if !data.is_empty() {
                return Some(data.join("\n"));
            }
        }
        None
    }
}

/// Push events the backend child writes to the pipe.
///
/// Never reconnects: when the pipe closes the child is gone for good.
#[derive(Debug, Clone)]
pub struct PipePushSource {
    connection: Arc<PipeConnection>,
}

impl PipePushSource {
    pub fn new(connection: Arc<PipeConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl PushSource for PipePushSource {
    async fn open(&self) -> Result<PushStream> {
        if !self.connection.is_open() {
            return Err(BridgeError::TransportUnavailable {
                reason: "backend pipe is closed".to_string(),
            });
        }

        let rx = self.connection.subscribe_push();
        let closed = self.connection.closed_signal();
        let events = stream::unfold((rx, closed), |(mut rx, mut closed)| async move {
            loop {
                tokio::select! {
                    biased;
                    received = rx.recv() => match received {
                        Ok(value) => return Some((Ok(value), (rx, closed))),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Push listener lagged, {} events dropped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                    _ = async { let _ = closed.wait_for(|closed| *closed).await; } => return None,
                }
            }
        });

        Ok(events.boxed())
    }

    fn reconnects(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        "pipe".to_string()
    }
}
