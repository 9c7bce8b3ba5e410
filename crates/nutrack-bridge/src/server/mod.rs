//! Backend-side ends of both transports.
//!
//! Used by backends written against this crate (and by the loopback
//! development backend) to answer the bridge:
//!
//! - **Dispatch**: the seam where route handlers plug in
//! - **Stdio**: request/response frames over stdin/stdout
//! - **HTTP**: an Axum router with `/sse` and a dispatching fallback
//! - **Broadcaster**: push events over whichever transport is active

pub mod broadcaster;
pub mod dispatch;
pub mod http;
pub mod stdio;

pub use broadcaster::{sse_data, Broadcaster, FrameSink, SseBroadcaster, StdioBroadcaster};
pub use dispatch::{BackendRequest, Dispatch};
pub use http::{http_router, start_http_server, HttpServerState};
pub use stdio::{error_frame, StdioServer, BACKEND_ERROR_CODE};
