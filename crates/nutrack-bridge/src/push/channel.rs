//! Push-event channel.
//!
//! One connection task per channel reads a [`PushSource`] and fans every
//! payload out to the registered handlers in subscription order. A
//! panicking handler is caught and logged; the rest still run.

use super::reconnect::ReconnectPolicy;
use super::sse::PushSource;
use futures::StreamExt;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Connection state of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before retry `attempt`.
    Reconnecting { attempt: u32 },
    /// The reconnect budget is spent; only an explicit `connect()` restarts.
    GivenUp,
}

impl ConnectionState {
    /// States in which `connect()` has nothing to do.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Reconnecting { .. }
        )
    }
}

/// Handler invoked with each unwrapped push payload.
pub type PushHandler = Arc<dyn Fn(&Value) + Send + Sync>;

struct ChannelInner {
    source: Arc<dyn PushSource>,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    subscribers: Mutex<Vec<(u64, PushHandler)>>,
    next_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelInner {
    fn subscribers(&self) -> MutexGuard<'_, Vec<(u64, PushHandler)>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn deliver(&self, payload: Value) {
        let message = unwrap_payload(payload);
        // Snapshot so handlers can subscribe or unsubscribe while running.
        let handlers: Vec<PushHandler> =
            self.subscribers().iter().map(|(_, h)| h.clone()).collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&message))).is_err() {
                error!("Push handler panicked while handling {}", message);
            }
        }
    }

    fn disconnect(&self) {
        if let Some(task) = self.task().take() {
            task.abort();
        }
        // Dropped after the lock is released; a handler may own a Subscription.
        let subscribers = std::mem::take(&mut *self.subscribers());
        drop(subscribers);
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Unwrap the `{"type":"sse","data":X}` envelope; anything else passes through.
pub fn unwrap_payload(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) if map.get("type").and_then(Value::as_str) == Some("sse") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Subscription-managed stream of backend push events.
#[derive(Clone)]
pub struct PushChannel {
    inner: Arc<ChannelInner>,
}

impl PushChannel {
    pub fn new(source: Arc<dyn PushSource>) -> Self {
        Self::with_policy(source, ReconnectPolicy::default())
    }

    pub fn with_policy(source: Arc<dyn PushSource>, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                source,
                policy,
                state_tx,
                subscribers: Mutex::new(vec![]),
                next_id: AtomicU64::new(1),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open the connection. No-op while connecting, connected or reconnecting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut task = self.inner.task();
        if self.state().is_active() {
            return;
        }
        if let Some(old) = task.take() {
            old.abort();
        }

        info!("Connecting push channel ({})", self.inner.source.describe());
        self.inner.set_state(ConnectionState::Connecting);
        *task = Some(tokio::spawn(run(Arc::downgrade(&self.inner))));
    }

    /// Register a handler; it stays registered while the guard lives.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: PushHandler = Arc::new(handler);
        self.inner.subscribers().push((id, handler));
        debug!("Push subscriber {} added", id);

        Subscription {
            channel: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Tear down the connection and drop every subscription.
    pub fn disconnect(&self) {
        debug!("Disconnecting push channel");
        self.inner.disconnect();
    }
}

impl std::fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushChannel")
            .field("source", &self.inner.source.describe())
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Connection loop. Holds only a weak reference so a forgotten channel
/// does not keep itself alive.
async fn run(inner: Weak<ChannelInner>) {
    let mut attempt = 0u32;

    loop {
        let Some(channel) = inner.upgrade() else { return };
        let source = channel.source.clone();
        let policy = channel.policy.clone();
        drop(channel);

        match source.open().await {
            Ok(mut stream) => {
                attempt = 0;
                match inner.upgrade() {
                    Some(channel) => channel.set_state(ConnectionState::Connected),
                    None => return,
                }
                info!("Push channel connected ({})", source.describe());

                while let Some(item) = stream.next().await {
                    let Some(channel) = inner.upgrade() else { return };
                    match item {
                        Ok(payload) => channel.deliver(payload),
                        Err(e) => {
                            warn!("Push stream error: {}", e);
                            break;
                        }
                    }
                }
                warn!("Push stream ended ({})", source.describe());
            }
            Err(e) => warn!("Failed to open push stream: {}", e),
        }

        let Some(channel) = inner.upgrade() else { return };
        if !source.reconnects() {
            channel.set_state(ConnectionState::Disconnected);
            return;
        }

        attempt += 1;
        let Some(delay) = policy.delay_for(attempt) else {
            error!("Max reconnection attempts reached");
            channel.set_state(ConnectionState::GivenUp);
            return;
        };

        channel.set_state(ConnectionState::Disconnected);
        info!(
            "Attempting to reconnect ({}/{}) in {:?}",
            attempt, policy.max_attempts, delay
        );
        channel.set_state(ConnectionState::Reconnecting { attempt });
        drop(channel);

        tokio::time::sleep(delay).await;
    }
}

/// Guard for one registered handler.
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) removes the
/// handler. Removing the last handler disconnects the channel.
#[must_use = "the handler is removed when the subscription is dropped"]
pub struct Subscription {
    channel: Weak<ChannelInner>,
    id: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(channel) = self.channel.upgrade() else { return };

        let now_empty = {
            let mut subscribers = channel.subscribers();
            subscribers.retain(|(id, _)| *id != self.id);
            subscribers.is_empty()
        };
        debug!("Push subscriber {} removed", self.id);

        if now_empty {
            channel.disconnect();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BridgeError, Result};
    use crate::push::sse::PushStream;
    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// Source fed by a test through an mpsc channel; opens once.
    struct ManualSource {
        rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    }

    impl ManualSource {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Value>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    rx: Mutex::new(Some(rx)),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl PushSource for ManualSource {
        async fn open(&self) -> Result<PushStream> {
            let rx = self.rx.lock().unwrap().take().ok_or_else(|| {
                BridgeError::TransportUnavailable {
                    reason: "already opened".into(),
                }
            })?;
            Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|v| (Ok(v), rx))
            })
            .boxed())
        }

        fn reconnects(&self) -> bool {
            false
        }

        fn describe(&self) -> String {
            "manual".into()
        }
    }

    /// Source that never opens and records when it was asked to.
    struct FailingSource {
        opened_at: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl PushSource for FailingSource {
        async fn open(&self) -> Result<PushStream> {
            self.opened_at.lock().unwrap().push(Instant::now());
            Err(BridgeError::TransportUnavailable {
                reason: "connection refused".into(),
            })
        }

        fn reconnects(&self) -> bool {
            true
        }

        fn describe(&self) -> String {
            "failing".into()
        }
    }

    async fn wait_for_state(channel: &PushChannel, wanted: ConnectionState) {
        let mut rx = channel.watch_state();
        rx.wait_for(|s| *s == wanted).await.unwrap();
    }

    #[test]
    fn test_unwrap_payload() {
        assert_eq!(unwrap_payload(json!("DB_UPDATED")), json!("DB_UPDATED"));
        assert_eq!(
            unwrap_payload(json!({"type": "sse", "data": {"table": "dishes"}})),
            json!({"table": "dishes"})
        );
        assert_eq!(
            unwrap_payload(json!({"type": "other", "data": 1})),
            json!({"type": "other", "data": 1})
        );
    }

    #[tokio::test]
    async fn test_fan_out_survives_panicking_handler() {
        let (source, tx) = ManualSource::new();
        let channel = PushChannel::new(source);

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let first = seen_tx.clone();
        let _a = channel.subscribe(move |v| first.send(("a", v.clone())).unwrap());
        let _b = channel.subscribe(|_| panic!("handler bug"));
        let third = seen_tx.clone();
        let _c = channel.subscribe(move |v| third.send(("c", v.clone())).unwrap());

        channel.connect();
        tx.send(json!("DB_UPDATED")).unwrap();

        assert_eq!(seen_rx.recv().await.unwrap(), ("a", json!("DB_UPDATED")));
        assert_eq!(seen_rx.recv().await.unwrap(), ("c", json!("DB_UPDATED")));
        assert_eq!(channel.subscriber_count(), 3);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (source, tx) = ManualSource::new();
        let channel = PushChannel::new(source);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let _sub = channel.subscribe(move |v| seen_tx.send(v.clone()).unwrap());

        channel.connect();
        channel.connect();
        wait_for_state(&channel, ConnectionState::Connected).await;
        channel.connect();

        tx.send(json!({"type": "sse", "data": "once"})).unwrap();
        assert_eq!(seen_rx.recv().await.unwrap(), json!("once"));
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_last_unsubscribe_disconnects() {
        let (source, _tx) = ManualSource::new();
        let channel = PushChannel::new(source);
        let a = channel.subscribe(|_| {});
        let b = channel.subscribe(|_| {});

        channel.connect();
        wait_for_state(&channel, ConnectionState::Connected).await;

        a.unsubscribe();
        assert_eq!(channel.subscriber_count(), 1);
        assert!(channel.is_connected());

        drop(b);
        assert_eq!(channel.subscriber_count(), 0);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_with_handler_owning_a_subscription() {
        let (source, _tx) = ManualSource::new();
        let channel = PushChannel::new(source);
        let owned = channel.subscribe(|_| {});
        let _outer = channel.subscribe(move |_| {
            let _ = owned.id();
        });

        channel.disconnect();

        assert_eq!(channel.subscriber_count(), 0);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_then_give_up() {
        let source = Arc::new(FailingSource {
            opened_at: Mutex::new(vec![]),
        });
        let channel = PushChannel::new(source.clone());
        let _sub = channel.subscribe(|_| {});

        let started = Instant::now();
        channel.connect();
        wait_for_state(&channel, ConnectionState::GivenUp).await;

        let offsets: Vec<u64> = source
            .opened_at
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(started).as_secs())
            .collect();
        // Initial attempt plus five retries at +1s, +2s, +3s, +4s, +5s.
        assert_eq!(offsets, vec![0, 1, 3, 6, 10, 15]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.opened_at.lock().unwrap().len(), 6);
        assert_eq!(channel.state(), ConnectionState::GivenUp);
    }

    #[tokio::test]
    async fn test_non_reconnecting_source_ends_disconnected() {
        let (source, tx) = ManualSource::new();
        let channel = PushChannel::new(source);
        let _sub = channel.subscribe(|_| {});

        channel.connect();
        wait_for_state(&channel, ConnectionState::Connected).await;
        drop(tx);

        wait_for_state(&channel, ConnectionState::Disconnected).await;
    }
}
