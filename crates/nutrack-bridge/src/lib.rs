//! Nutrack Bridge - dual-transport RPC and push-event bridge.
//!
//! Application calls are routed either as HTTP requests or as line-delimited
//! JSON frames over the stdio pipe of a spawned backend process. Many calls
//! can be in flight on one pipe; each response is matched to its caller by
//! correlation id and every call has a fixed 30 second deadline. Backend push
//! events fan out to subscribers, and the sync-conflict handshake runs on
//! top of them.
//!
//! # Example
//!
//! ```rust,ignore
//! use nutrack_bridge::{Bridge, BridgeSettings, LogicalRequest};
//!
//! #[tokio::main]
//! async fn main() -> nutrack_bridge::Result<()> {
//!     let settings = BridgeSettings::load("config.json")?;
//!     let bridge = Bridge::start(settings)?;
//!
//!     let items = bridge.call(LogicalRequest::get("/foodItems/all")).await?;
//!     println!("{}", items);
//!
//!     let _sub = bridge.subscribe(|event| println!("push: {}", event));
//!
//!     bridge.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod pending;
pub mod process;
pub mod protocol;
pub mod push;
pub mod server;
pub mod sync;
pub mod transport;

mod bridge;

pub use bridge::{Bridge, BridgeBuilder};
pub use config::{BridgeSettings, PackagingMode};
pub use error::{BridgeError, Result};
pub use pending::{CorrelationId, PendingCall, PendingTable};
pub use process::{BackendExit, BackendLaunchConfig, ChildSupervisor, PipeConnection};
pub use protocol::FramedMessage;
pub use push::{ConnectionState, PushChannel, ReconnectPolicy, Subscription};
pub use sync::{ConflictCallbacks, ConflictResolution, DecisionSurface, SyncConflictCoordinator};
pub use transport::{LogicalRequest, Method, TransportMode, TransportRouter};
