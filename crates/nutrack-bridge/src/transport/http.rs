//! HTTP transport.

use super::{LogicalRequest, Method, Transport, TransportMode};
use crate::config::NetworkConfig;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::debug;

/// Sends logical requests as REST calls against a base URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for `base_url` (no trailing slash expected).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| BridgeError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                source: Some(e),
            })?;

        Ok(Self::with_client(client, base_url))
    }

    /// Reuse an existing client (shared with the SSE source).
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Full URL for a request.
    pub fn url_for(&self, request: &LogicalRequest) -> String {
        format!("{}{}", self.base_url, request.packaged_path())
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &LogicalRequest) -> Result<Value> {
        let url = self.url_for(request);

        let mut builder = self.client.request(to_reqwest(request.method), &url);
        if request.method.carries_body() {
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }
        }

        let response = builder.send().await.map_err(|e| BridgeError::Network {
            message: format!("{} {} failed: {}", request.method, url, e),
            source: Some(e),
        })?;

        let status = response.status();
        if !status.is_success() {
            debug!("{} {} returned {}", request.method, url, status);
            return Err(BridgeError::Remote {
                message: status.canonical_reason().unwrap_or("HTTP error").to_string(),
                status: Some(status.as_u16()),
                code: None,
            });
        }

        let is_json = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("application/json"))
            .unwrap_or(false);

        if !is_json {
            return Ok(Value::Null);
        }

        response.json::<Value>().await.map_err(|e| BridgeError::Network {
            message: format!("Failed to read JSON from {}: {}", url, e),
            source: Some(e),
        })
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Http
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{OriginalUri, Path};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn test_router() -> Router {
        Router::new()
            .route(
                "/dishes/:id",
                get(|Path(id): Path<String>| async move { Json(json!({"id": id})) }),
            )
            .route(
                "/foodItems/search",
                get(|OriginalUri(uri): OriginalUri| async move {
                    Json(json!({"query": uri.query().unwrap_or_default()}))
                }),
            )
            .route(
                "/foodItems",
                post(|Json(body): Json<Value>| async move { Json(json!({"created": body})) }),
            )
            .route("/plain", get(|| async { "ok" }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
    }

    #[tokio::test]
    async fn test_path_params_and_json() {
        let transport = HttpTransport::new(serve(test_router()).await).unwrap();

        let result = transport
            .send(&LogicalRequest::get("/dishes").with_param("42"))
            .await
            .unwrap();
        assert_eq!(result, json!({"id": "42"}));
    }

    #[tokio::test]
    async fn test_search_params_become_query() {
        let transport = HttpTransport::new(serve(test_router()).await).unwrap();

        let result = transport
            .send(&LogicalRequest::get("/foodItems/search").with_params(["q=oat", "limit=5"]))
            .await
            .unwrap();
        assert_eq!(result, json!({"query": "q=oat&limit=5"}));
    }

    #[tokio::test]
    async fn test_post_sends_json_body() {
        let transport = HttpTransport::new(serve(test_router()).await).unwrap();

        let result = transport
            .send(&LogicalRequest::post("/foodItems").with_body(json!({"name": "Oats"})))
            .await
            .unwrap();
        assert_eq!(result, json!({"created": {"name": "Oats"}}));
    }

    #[tokio::test]
    async fn test_non_json_success_is_null() {
        let transport = HttpTransport::new(serve(test_router()).await).unwrap();
        let result = transport.send(&LogicalRequest::get("/plain")).await.unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn test_error_status_is_remote() {
        let transport = HttpTransport::new(serve(test_router()).await).unwrap();
        let err = transport
            .send(&LogicalRequest::get("/missing"))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), Some(404));
        assert_eq!(err.to_string(), "HTTP error! status: 404");
        assert!(!err.is_transport_failure());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(format!("http://{}", addr)).unwrap();
        let err = transport.send(&LogicalRequest::get("/dishes")).await.unwrap_err();
        assert!(matches!(err, BridgeError::Network { .. }));
        assert!(err.is_transport_failure());
    }
}
