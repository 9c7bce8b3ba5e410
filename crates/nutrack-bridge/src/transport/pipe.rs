//! Pipe transport.

use super::{LogicalRequest, Transport, TransportMode};
use crate::config::PipeConfig;
use crate::error::Result;
use crate::pending::new_correlation_id;
use crate::process::PipeConnection;
use crate::protocol::FramedMessage;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sends logical requests as framed messages over the backend's stdio.
#[derive(Debug, Clone)]
pub struct PipeTransport {
    connection: Arc<PipeConnection>,
    timeout: Duration,
}

impl PipeTransport {
    pub fn new(connection: Arc<PipeConnection>) -> Self {
        Self {
            connection,
            timeout: PipeConfig::REQUEST_TIMEOUT,
        }
    }

    pub fn connection(&self) -> &Arc<PipeConnection> {
        &self.connection
    }
}

/// Build the `data` object of a request frame.
///
/// Object bodies are flattened into it, anything else travels under `body`.
/// `urlParams` is always present; search requests also carry the joined
/// query string as `query`.
pub fn request_data(request: &LogicalRequest) -> Value {
    let mut data = match &request.body {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            let mut map = Map::new();
            map.insert("body".to_string(), other.clone());
            map
        }
    };

    data.insert(
        "urlParams".to_string(),
        Value::Array(request.params.iter().cloned().map(Value::String).collect()),
    );
    if let Some(query) = request.search_query() {
        data.insert("query".to_string(), Value::String(query));
    }

    Value::Object(data)
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&self, request: &LogicalRequest) -> Result<Value> {
        let id = new_correlation_id();
        let frame = FramedMessage::request(
            id.clone(),
            request.method.as_str(),
            request.endpoint.clone(),
            request_data(request),
        );

        // Registered before the write so a fast response cannot miss its entry.
        let call = self.connection.pending().register(id.clone(), self.timeout)?;
        self.connection.send(&frame)?;
        debug!("Sent request {} {} {}", id, request.method, request.endpoint);

        call.wait().await
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Pipe
    }
}
