//! Backend end of the HTTP transport, using Axum.
//!
//! `GET /sse` streams push events; every other `METHOD /path?query` goes to
//! the [`Dispatch`] implementation.

use super::broadcaster::SseBroadcaster;
use super::dispatch::{BackendRequest, Dispatch};
use crate::config::PushConfig;
use crate::error::BridgeError;
use crate::transport::Method;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct HttpServerState {
    pub dispatch: Arc<dyn Dispatch>,
    pub broadcaster: SseBroadcaster,
}

/// Build the backend's HTTP router.
pub fn http_router(dispatch: Arc<dyn Dispatch>, broadcaster: SseBroadcaster) -> Router {
    let state = HttpServerState {
        dispatch,
        broadcaster,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(PushConfig::SSE_PATH, get(handle_sse))
        .fallback(handle_dispatch)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind `addr` and serve the router in the background.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_http_server(
    dispatch: Arc<dyn Dispatch>,
    broadcaster: SseBroadcaster,
    addr: SocketAddr,
) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    info!("Server listening on {}", actual_addr);

    let app = http_router(dispatch, broadcaster);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("HTTP server stopped: {}", e);
        }
    });

    Ok(actual_addr)
}

async fn handle_sse(
    State(state): State<HttpServerState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.broadcaster.subscribe();
    info!("SSE client connected ({} total)", state.broadcaster.client_count());

    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(data) => return Some((Ok(Event::default().data(data)), rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SSE client too slow, {} messages dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn handle_dispatch(
    State(state): State<HttpServerState>,
    method: axum::http::Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let Ok(method) = method.as_str().parse::<Method>() else {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    };

    let data = match body_to_data(&body) {
        Ok(data) => data,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };

    let endpoint = match uri.query() {
        Some(query) => format!("{}?{}", uri.path(), query),
        None => uri.path().to_string(),
    };
    debug!("HTTP {} {}", method, endpoint);

    let request = BackendRequest {
        method,
        endpoint,
        data,
        url_params: vec![],
    };

    match state.dispatch.dispatch(request).await {
        Ok(value) => Json(value).into_response(),
        Err(BridgeError::Remote {
            message, status, ..
        }) => {
            let status = status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_REQUEST);
            error_response(status, &message)
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn body_to_data(body: &[u8]) -> Result<Map<String, Value>, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }

    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => {
            let mut map = Map::new();
            map.insert("body".to_string(), other);
            Ok(map)
        }
        Err(e) => Err(format!("Invalid JSON body: {}", e)),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
