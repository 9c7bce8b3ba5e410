//! Seam between the transport ends and the backend's route handlers.

use crate::error::{BridgeError, Result};
use crate::protocol::RequestFrame;
use crate::transport::{is_search_endpoint, package_path, Method};
use serde_json::{Map, Value};

/// A request as the backend's handlers see it, whichever wire it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub method: Method,
    pub endpoint: String,
    /// Request payload; always an object.
    pub data: Map<String, Value>,
    pub url_params: Vec<String>,
}

impl BackendRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            data: Map::new(),
            url_params: vec![],
        }
    }

    /// Validate a pipe request frame the way the backend always has.
    pub fn from_frame(frame: &RequestFrame) -> Result<Self> {
        let method = frame
            .method
            .parse::<Method>()
            .map_err(|_| BridgeError::remote(format!("Unsupported method: {}", frame.method)))?;

        let Value::Object(data) = &frame.data else {
            return Err(BridgeError::remote("Invalid request data format"));
        };
        if !matches!(data.get("urlParams"), Some(Value::Array(_))) {
            return Err(BridgeError::remote("Invalid urlParams format"));
        }
        if !frame.endpoint.starts_with('/') {
            return Err(BridgeError::remote("Invalid endpoint"));
        }

        let mut data = data.clone();
        data.remove("urlParams");

        Ok(Self {
            method,
            endpoint: frame.endpoint.clone(),
            data,
            url_params: frame.url_params(),
        })
    }

    /// Endpoint with its params packaged back on, as an HTTP client would
    /// have sent it.
    pub fn path(&self) -> String {
        package_path(&self.endpoint, &self.url_params)
    }

    /// Route segments of [`path`](Self::path) with the query dropped.
    ///
    /// Pipe requests carry their params separately and HTTP requests carry
    /// them in the path, so both end up with the same segments.
    pub fn segments(&self) -> Vec<&str> {
        let base = self.endpoint.split('?').next().unwrap_or_default();
        let params: &[String] = if is_search_endpoint(&self.endpoint) {
            &[]
        } else {
            &self.url_params
        };

        base.split('/')
            .chain(params.iter().flat_map(|p| p.split('/')))
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Backend route handlers.
#[async_trait::async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Handle one request and return the response payload.
    ///
    /// Errors are reported to the caller as `Remote` failures; a `Remote`
    /// error's status and code are kept where the wire allows.
    async fn dispatch(&self, request: BackendRequest) -> Result<Value>;
}
