//! Server-initiated push events.
//!
//! - **Channel**: connection state, reconnects, subscriber fan-out
//! - **Sources**: SSE over HTTP, or push frames from the backend pipe
//! - **Reconnect**: linear backoff schedule

pub mod channel;
pub mod reconnect;
pub mod sse;

pub use channel::{unwrap_payload, ConnectionState, PushChannel, PushHandler, Subscription};
pub use reconnect::ReconnectPolicy;
pub use sse::{PipePushSource, PushSource, PushStream, SseParser, SseSource};
