//! Sync-conflict handshake.
//!
//! When the backend finds the local and cloud replicas diverged it pushes
//! the `SHOW_SYNC_CONFLICT` sentinel. The coordinator asks a
//! [`DecisionSurface`] what to do and runs exactly one recovery action
//! through the transport router. Sentinels arriving while a decision is
//! open are ignored.

use crate::config::PushConfig;
use crate::error::Result;
use crate::push::{PushChannel, Subscription};
use crate::transport::{LogicalRequest, TransportRouter};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info};

pub const UPLOAD_DATABASE_ENDPOINT: &str = "/dropbox/upload-database";
pub const DOWNLOAD_DATABASE_ENDPOINT: &str = "/dropbox/download-database";

/// The user's answer to a sync conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Overwrite the cloud copy with the local database.
    KeepLocal,
    /// Replace the local database with the cloud copy.
    TakeRemote,
    /// Do nothing.
    Cancel,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::KeepLocal => "keep-local",
            ConflictResolution::TakeRemote => "take-remote",
            ConflictResolution::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The two recovery actions offered for one conflict.
///
/// Consumed by whichever action runs, so a conflict is resolved at most once.
#[derive(Debug)]
pub struct ConflictCallbacks {
    router: TransportRouter,
}

impl ConflictCallbacks {
    pub fn new(router: TransportRouter) -> Self {
        Self { router }
    }

    pub fn keep_local_request() -> LogicalRequest {
        LogicalRequest::post(UPLOAD_DATABASE_ENDPOINT)
    }

    pub fn take_remote_request() -> LogicalRequest {
        LogicalRequest::get(DOWNLOAD_DATABASE_ENDPOINT)
    }

    pub async fn keep_local(self) -> Result<Value> {
        self.router.call(Self::keep_local_request()).await
    }

    pub async fn take_remote(self) -> Result<Value> {
        self.router.call(Self::take_remote_request()).await
    }

    /// Run the action for `resolution`; `None` when cancelled.
    pub async fn apply(self, resolution: ConflictResolution) -> Result<Option<Value>> {
        match resolution {
            ConflictResolution::KeepLocal => self.keep_local().await.map(Some),
            ConflictResolution::TakeRemote => self.take_remote().await.map(Some),
            ConflictResolution::Cancel => Ok(None),
        }
    }
}

/// Whatever presents the conflict to the user (dialog, terminal prompt).
#[async_trait]
pub trait DecisionSurface: Send + Sync {
    async fn decide(&self, callbacks: &ConflictCallbacks) -> ConflictResolution;
}

struct CoordinatorInner {
    router: TransportRouter,
    surface: Arc<dyn DecisionSurface>,
    open: AtomicBool,
}

/// Re-arms the coordinator when the handshake ends, even by panic.
struct OpenGuard<'a>(&'a AtomicBool);

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CoordinatorInner {
    async fn handshake(&self) -> Result<Option<Value>> {
        let _guard = OpenGuard(&self.open);

        let callbacks = ConflictCallbacks::new(self.router.clone());
        let resolution = self.surface.decide(&callbacks).await;
        info!("Sync conflict resolved: {}", resolution);

        callbacks.apply(resolution).await
    }
}

/// Watches push events for the sync-conflict sentinel.
pub struct SyncConflictCoordinator {
    inner: Arc<CoordinatorInner>,
    runtime: Handle,
    subscription: Option<Subscription>,
}

impl SyncConflictCoordinator {
    /// Create a coordinator that is not yet listening.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(router: TransportRouter, surface: Arc<dyn DecisionSurface>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                router,
                surface,
                open: AtomicBool::new(false),
            }),
            runtime: Handle::current(),
            subscription: None,
        }
    }

    /// Create a coordinator subscribed to `channel`.
    pub fn attach(
        channel: &PushChannel,
        router: TransportRouter,
        surface: Arc<dyn DecisionSurface>,
    ) -> Self {
        let mut coordinator = Self::new(router, surface);
        let inner = coordinator.inner.clone();
        let runtime = coordinator.runtime.clone();
        coordinator.subscription = Some(channel.subscribe(move |message| {
            Self::on_message(&inner, &runtime, message);
        }));
        coordinator
    }

    /// Feed one push payload. Returns `true` if it started a handshake.
    pub fn handle_message(&self, message: &Value) -> bool {
        Self::on_message(&self.inner, &self.runtime, message)
    }

    fn on_message(inner: &Arc<CoordinatorInner>, runtime: &Handle, message: &Value) -> bool {
        if message.as_str() != Some(PushConfig::SYNC_CONFLICT_SENTINEL) {
            return false;
        }

        if inner.open.swap(true, Ordering::SeqCst) {
            debug!("Sync conflict already open, ignoring sentinel");
            return false;
        }

        info!("Backend reported a sync conflict");
        let inner = inner.clone();
        runtime.spawn(async move {
            match inner.handshake().await {
                Ok(Some(result)) => debug!("Conflict recovery finished: {}", result),
                Ok(None) => debug!("Conflict recovery cancelled"),
                Err(e) => error!("Conflict recovery failed: {}", e),
            }
        });
        true
    }

    /// Whether a decision is currently pending.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Run one handshake now, without waiting for a sentinel.
    pub async fn resolve_now(&self) -> Result<Option<Value>> {
        if self.inner.open.swap(true, Ordering::SeqCst) {
            debug!("Sync conflict already open");
            return Ok(None);
        }
        self.inner.handshake().await
    }

    /// Stop listening for sentinels.
    pub fn detach(&mut self) {
        self.subscription.take();
    }
}

impl std::fmt::Debug for SyncConflictCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConflictCoordinator")
            .field("open", &self.is_open())
            .field("listening", &self.subscription.is_some())
            .finish()
    }
}
