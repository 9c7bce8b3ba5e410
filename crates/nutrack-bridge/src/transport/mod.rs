//! Transport router.
//!
//! Application code issues [`LogicalRequest`]s and never learns which wire
//! carried them. The transport is chosen once, when the router is built:
//!
//! - **HTTP**: plain REST against the configured base URL
//! - **Pipe**: framed JSON over the backend child's stdio

pub mod http;
pub mod pipe;

pub use http::HttpTransport;
pub use pipe::PipeTransport;

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// HTTP verb of a logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }

    /// Whether a body is sent on the HTTP transport.
    pub fn carries_body(&self) -> bool {
        !matches!(self, Method::Get)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Method {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            other => Err(BridgeError::Config {
                message: format!("Unsupported method: {}", other),
            }),
        }
    }
}

/// One intended operation against the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalRequest {
    pub method: Method,
    pub endpoint: String,
    pub body: Option<Value>,
    /// Ordered path segments, or query fragments for search endpoints.
    pub params: Vec<String>,
}

impl LogicalRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body: None,
            params: vec![],
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Get, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Post, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Put, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::Delete, endpoint)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    pub fn is_search(&self) -> bool {
        is_search_endpoint(&self.endpoint) && !self.params.is_empty()
    }

    /// Endpoint with params packaged the way both transports agree on.
    pub fn packaged_path(&self) -> String {
        package_path(&self.endpoint, &self.params)
    }

    /// The query string a search request carries, without the leading `?`.
    pub fn search_query(&self) -> Option<String> {
        self.is_search().then(|| self.params.join("&"))
    }
}

/// Search endpoints take their params as a query string.
pub fn is_search_endpoint(endpoint: &str) -> bool {
    endpoint.contains("search")
}

/// Package params onto an endpoint.
///
/// - search endpoint with params: `endpoint?p1&p2` (or `&` when a query exists)
/// - other endpoints with params: `endpoint/p1/p2`
/// - no params: the endpoint unchanged
pub fn package_path(endpoint: &str, params: &[String]) -> String {
    if params.is_empty() {
        return endpoint.to_string();
    }

    if is_search_endpoint(endpoint) {
        let base = endpoint.strip_suffix('?').unwrap_or(endpoint);
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{}{}{}", base, separator, params.join("&"))
    } else {
        format!("{}/{}", endpoint, params.join("/"))
    }
}

/// Which wire the router sends calls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Http,
    Pipe,
}

impl TransportMode {
    pub fn from_use_pipe(use_pipe: bool) -> Self {
        if use_pipe {
            TransportMode::Pipe
        } else {
            TransportMode::Http
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Http => "http",
            TransportMode::Pipe => "pipe",
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A wire that can carry logical requests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &LogicalRequest) -> Result<Value>;

    fn mode(&self) -> TransportMode;
}

/// Single entry point for application calls.
#[derive(Clone)]
pub struct TransportRouter {
    transport: Arc<dyn Transport>,
}

impl TransportRouter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn mode(&self) -> TransportMode {
        self.transport.mode()
    }

    /// Send a request and return the backend's payload.
    ///
    /// Never retried; a failure is returned to the caller as is.
    pub async fn call(&self, request: LogicalRequest) -> Result<Value> {
        debug!(
            "{} {} via {}",
            request.method,
            request.packaged_path(),
            self.transport.mode()
        );
        self.transport.send(&request).await
    }

    /// Send a request and deserialize the payload.
    pub async fn call_json<T: DeserializeOwned>(&self, request: LogicalRequest) -> Result<T> {
        let value = self.call(request).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl std::fmt::Debug for TransportRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRouter")
            .field("mode", &self.transport.mode())
            .finish()
    }
}
