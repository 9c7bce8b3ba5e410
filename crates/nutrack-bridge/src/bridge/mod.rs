//! The bridge service object.
//!
//! Owns the transport router, the push channel and, when it spawned the
//! backend, the child supervisor. Call sites receive it explicitly; there
//! is no process-wide instance.

mod builder;

pub use builder::BridgeBuilder;

use crate::config::BridgeSettings;
use crate::error::Result;
use crate::process::{BackendExit, ChildSupervisor};
use crate::push::{PushChannel, Subscription};
use crate::sync::{DecisionSurface, SyncConflictCoordinator};
use crate::transport::{LogicalRequest, TransportMode, TransportRouter};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub struct Bridge {
    router: TransportRouter,
    push: PushChannel,
    supervisor: Option<ChildSupervisor>,
    settings: BridgeSettings,
}

impl Bridge {
    pub fn builder(settings: BridgeSettings) -> BridgeBuilder {
        BridgeBuilder::new(settings)
    }

    /// Build with default options. See [`BridgeBuilder::build`].
    pub fn start(settings: BridgeSettings) -> Result<Self> {
        BridgeBuilder::new(settings).build()
    }

    pub fn mode(&self) -> TransportMode {
        self.router.mode()
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn router(&self) -> &TransportRouter {
        &self.router
    }

    pub fn push(&self) -> &PushChannel {
        &self.push
    }

    /// The backend child, when this bridge spawned one.
    pub fn supervisor(&self) -> Option<&ChildSupervisor> {
        self.supervisor.as_ref()
    }

    pub async fn call(&self, request: LogicalRequest) -> Result<Value> {
        self.router.call(request).await
    }

    pub async fn call_json<T: DeserializeOwned>(&self, request: LogicalRequest) -> Result<T> {
        self.router.call_json(request).await
    }

    /// Subscribe to push events and make sure the channel is connected.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let subscription = self.push.subscribe(handler);
        self.push.connect();
        subscription
    }

    /// Start watching for sync conflicts, presenting them on `surface`.
    pub fn conflict_coordinator(&self, surface: Arc<dyn DecisionSurface>) -> SyncConflictCoordinator {
        let coordinator = SyncConflictCoordinator::attach(&self.push, self.router.clone(), surface);
        self.push.connect();
        coordinator
    }

    /// Wait for the spawned backend to exit; `None` without a supervisor.
    pub async fn wait_for_backend_exit(&self) -> Option<BackendExit> {
        match &self.supervisor {
            Some(supervisor) => supervisor.wait_for_exit().await,
            None => None,
        }
    }

    /// Disconnect the push channel and terminate the backend child.
    ///
    /// Returns without waiting for the child to exit.
    pub fn shutdown(&self) {
        info!("Shutting down bridge");
        self.push.disconnect();
        if let Some(supervisor) = &self.supervisor {
            supervisor.terminate();
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("mode", &self.mode())
            .field("push", &self.push)
            .field("supervisor", &self.supervisor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::process::PipeConnection;
    use crate::push::ConnectionState;
    use crate::server::{BackendRequest, Broadcaster, Dispatch, StdioServer};
    use serde_json::json;
    use tokio::io::duplex;

    struct Echo;

    #[async_trait::async_trait]
    impl Dispatch for Echo {
        async fn dispatch(&self, request: BackendRequest) -> Result<Value> {
            Ok(json!({"path": request.path()}))
        }
    }

    #[tokio::test]
    async fn test_pipe_bridge_over_duplex() {
        let (host_out, backend_in) = duplex(64 * 1024);
        let (backend_out, host_in) = duplex(64 * 1024);
        let server = StdioServer::new(Arc::new(Echo), backend_out);
        let broadcaster = server.broadcaster();
        tokio::spawn(async move { server.serve(backend_in).await });

        let connection = Arc::new(PipeConnection::attach(host_out, host_in));
        let bridge = Bridge::builder(BridgeSettings::default().with_pipe(false))
            .with_pipe_connection(connection)
            .build()
            .unwrap();
        assert_eq!(bridge.mode(), TransportMode::Pipe);
        assert!(bridge.supervisor().is_none());

        let result = bridge
            .call(LogicalRequest::get("/dishes").with_param("9"))
            .await
            .unwrap();
        assert_eq!(result, json!({"path": "/dishes/9"}));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = bridge.subscribe(move |v| {
            let _ = tx.send(v.clone());
        });
        bridge
            .push()
            .watch_state()
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        broadcaster.broadcast(json!("DB_UPDATED"));
        assert_eq!(rx.recv().await.unwrap(), json!("DB_UPDATED"));

        bridge.shutdown();
        assert_eq!(bridge.push().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_http_bridge_rejects_bad_url() {
        let settings = BridgeSettings::default()
            .with_pipe(false)
            .with_backend_url("http://exa mple");
        let result = Bridge::start(settings);
        assert!(matches!(result, Err(BridgeError::Config { .. })));
    }
}
