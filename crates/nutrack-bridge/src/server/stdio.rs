//! Backend end of the stdio pipe.
//!
//! Reads request frames line by line, dispatches each one on its own task
//! and writes the responses through a single serialized writer, so
//! responses may leave in a different order than the requests arrived.

use super::broadcaster::{FrameSink, Outbound, StdioBroadcaster};
use super::dispatch::{BackendRequest, Dispatch};
use crate::error::{BridgeError, Result};
use crate::protocol::{encode, FrameReader, FramedMessage, RequestFrame, ResponseFrame};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Error code attached to handler failures that carry none.
pub const BACKEND_ERROR_CODE: &str = "BACKEND_ERROR";

/// Error response in the backend's wire shape: `data.error = {message, code}`.
pub fn error_frame(request_id: impl Into<String>, message: impl Into<String>, code: &str) -> FramedMessage {
    FramedMessage::Response(ResponseFrame {
        request_id: request_id.into(),
        data: Some(json!({"error": {"message": message.into(), "code": code}})),
        error: None,
    })
}

/// Request/response server over a byte-stream pair.
pub struct StdioServer {
    dispatch: Arc<dyn Dispatch>,
    sink: FrameSink,
}

impl StdioServer {
    /// Start the writer task over `writer` (normally stdout).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<W>(dispatch: Arc<dyn Dispatch>, writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::writer_loop(writer, rx));
        Self {
            dispatch,
            sink: FrameSink { tx },
        }
    }

    /// Push broadcaster sharing this server's writer.
    pub fn broadcaster(&self) -> StdioBroadcaster {
        StdioBroadcaster::new(self.sink.clone())
    }

    pub fn sink(&self) -> &FrameSink {
        &self.sink
    }

    async fn writer_loop<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(frame) => {
                    let line = match encode(&frame) {
                        Ok(line) => line,
                        Err(e) => {
                            error!("Failed to encode {} frame: {}", frame.kind(), e);
                            continue;
                        }
                    };
                    let written = async {
                        writer.write_all(&line).await?;
                        writer.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        error!("Failed to write to stdout: {}", e);
                        break;
                    }
                }
                Outbound::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Stdout writer stopped");
    }

    /// Serve requests from `reader` until it ends.
    ///
    /// Waits for in-flight handlers and flushes their responses before
    /// returning.
    pub async fn serve<R: AsyncRead + Unpin>(&self, reader: R) -> Result<()> {
        info!("StandardIO handler started - waiting for input");

        let mut lines = FrameReader::new(reader);
        let mut in_flight = JoinSet::new();

        while let Some(line) = lines.next_line().await? {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match parse_request(&line) {
                Ok(request) => {
                    let dispatch = self.dispatch.clone();
                    let sink = self.sink.clone();
                    in_flight.spawn(async move {
                        let frame = handle(dispatch.as_ref(), request).await;
                        sink.send(frame);
                    });
                }
                Err(frame) => {
                    self.sink.send(frame);
                }
            }

            // Reap finished handlers so the set does not grow unbounded.
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("Request handler task failed: {}", e);
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Request handler task failed: {}", e);
            }
        }
        self.sink.flush().await;

        info!("Standard input closed");
        Ok(())
    }
}

/// Parse one input line, or build the error response it deserves.
fn parse_request(line: &[u8]) -> std::result::Result<RequestFrame, FramedMessage> {
    let value: Value = serde_json::from_slice(line).map_err(|e| {
        debug!("Invalid JSON on stdin: {}", e);
        error_frame("", "Invalid JSON request format", BACKEND_ERROR_CODE)
    })?;

    let request_id = value
        .get("requestId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if value.get("type").and_then(Value::as_str) != Some("request") {
        return Err(error_frame(request_id, "Invalid request type", BACKEND_ERROR_CODE));
    }

    match serde_json::from_value::<FramedMessage>(value) {
        Ok(FramedMessage::Request(request)) => Ok(request),
        Ok(other) => Err(error_frame(
            request_id,
            format!("Unexpected {} frame", other.kind()),
            BACKEND_ERROR_CODE,
        )),
        Err(e) => Err(error_frame(
            request_id,
            format!("Invalid request format: {}", e),
            BACKEND_ERROR_CODE,
        )),
    }
}

async fn handle(dispatch: &dyn Dispatch, frame: RequestFrame) -> FramedMessage {
    debug!(
        "Request received [{}]: {} {}",
        frame.request_id, frame.method, frame.endpoint
    );

    let result = match BackendRequest::from_frame(&frame) {
        Ok(request) => dispatch.dispatch(request).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(data) => FramedMessage::response(frame.request_id, data),
        Err(e) => {
            warn!("Request {} failed: {}", frame.request_id, e);
            let code = match &e {
                BridgeError::Remote { code: Some(code), .. } => code.clone(),
                _ => BACKEND_ERROR_CODE.to_string(),
            };
            let message = match e {
                BridgeError::Remote { message, .. } => message,
                other => other.to_string(),
            };
            error_frame(frame.request_id, message, &code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_line;
    use crate::server::Broadcaster;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    struct Echo;

    #[async_trait::async_trait]
    impl Dispatch for Echo {
        async fn dispatch(&self, request: BackendRequest) -> Result<Value> {
            match request.segments().as_slice() {
                ["slow"] => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!("slow"))
                }
                ["fail"] => Err(BridgeError::remote("ProfileID is required")),
                _ => Ok(json!({
                    "method": request.method.as_str(),
                    "endpoint": request.endpoint.clone(),
                    "params": request.url_params.clone(),
                })),
            }
        }
    }

    async fn read_frame(lines: &mut tokio::io::Lines<BufReader<tokio::io::DuplexStream>>) -> FramedMessage {
        let line = lines.next_line().await.unwrap().unwrap();
        decode_line(line.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_json_gets_error_with_empty_id() {
        let (out_w, out_r) = duplex(4096);
        let server = StdioServer::new(Arc::new(Echo), out_w);
        let mut lines = BufReader::new(out_r).lines();

        server.serve(&b"{not json\n"[..]).await.unwrap();

        let FramedMessage::Response(response) = read_frame(&mut lines).await else {
            panic!("expected a response");
        };
        assert_eq!(response.request_id, "");
        let err = response.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Invalid JSON request format");
    }

    #[tokio::test]
    async fn test_responses_matched_by_id_not_order() {
        let (out_w, out_r) = duplex(4096);
        let server = StdioServer::new(Arc::new(Echo), out_w);
        let mut lines = BufReader::new(out_r).lines();

        let input = [
            encode(&FramedMessage::request("a", "GET", "/slow", json!({"urlParams": []}))).unwrap(),
            encode(&FramedMessage::request("b", "GET", "/dishes", json!({"urlParams": ["3"]}))).unwrap(),
        ]
        .concat();
        server.serve(&input[..]).await.unwrap();

        let first = read_frame(&mut lines).await;
        let second = read_frame(&mut lines).await;
        assert_eq!(first.request_id(), Some("b"));
        assert_eq!(second.request_id(), Some("a"));

        let FramedMessage::Response(response) = first else {
            panic!("expected a response");
        };
        assert_eq!(
            response.into_result().unwrap(),
            json!({"method": "GET", "endpoint": "/dishes", "params": ["3"]})
        );
    }

    #[tokio::test]
    async fn test_handler_error_uses_backend_shape() {
        let (out_w, out_r) = duplex(4096);
        let server = StdioServer::new(Arc::new(Echo), out_w);
        let mut lines = BufReader::new(out_r).lines();

        let input = encode(&FramedMessage::request("x", "POST", "/fail", json!({"urlParams": []}))).unwrap();
        server.serve(&input[..]).await.unwrap();

        let line = lines.next_line().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["data"]["error"]["message"], "ProfileID is required");
        assert_eq!(value["data"]["error"]["code"], "BACKEND_ERROR");
    }

    #[tokio::test]
    async fn test_non_request_frames_rejected() {
        let (out_w, out_r) = duplex(4096);
        let server = StdioServer::new(Arc::new(Echo), out_w);
        let mut lines = BufReader::new(out_r).lines();

        server
            .serve(&b"{\"type\":\"response\",\"requestId\":\"q\"}\n\n"[..])
            .await
            .unwrap();

        let frame = read_frame(&mut lines).await;
        assert_eq!(frame.request_id(), Some("q"));
    }

    #[tokio::test]
    async fn test_broadcaster_shares_writer() {
        let (out_w, out_r) = duplex(4096);
        let server = StdioServer::new(Arc::new(Echo), out_w);
        let mut lines = BufReader::new(out_r).lines();

        server.broadcaster().broadcast(json!("DB_UPDATED"));
        server.sink().flush().await;

        assert_eq!(read_frame(&mut lines).await, FramedMessage::push(json!("DB_UPDATED")));
    }
}
