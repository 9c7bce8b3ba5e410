//! Builder for configuring Bridge initialization.

use super::Bridge;
use crate::config::BridgeSettings;
use crate::error::Result;
use crate::process::{BackendLaunchConfig, ChildSupervisor, PipeConnection};
use crate::push::{PipePushSource, PushChannel, PushSource, ReconnectPolicy, SseSource};
use crate::transport::{HttpTransport, PipeTransport, Transport, TransportMode, TransportRouter};
use std::sync::Arc;
use tracing::info;

/// Builder for configuring Bridge initialization.
///
/// # Example
///
/// ```rust,ignore
/// use nutrack_bridge::{Bridge, BridgeSettings};
///
/// let settings = BridgeSettings::load("config.json")?;
/// let bridge = Bridge::builder(settings)
///     .with_reconnect_policy(ReconnectPolicy::new().with_max_attempts(3))
///     .build()?;
/// ```
pub struct BridgeBuilder {
    settings: BridgeSettings,
    launch: Option<BackendLaunchConfig>,
    connection: Option<Arc<PipeConnection>>,
    policy: ReconnectPolicy,
}

impl BridgeBuilder {
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            settings,
            launch: None,
            connection: None,
            policy: ReconnectPolicy::default(),
        }
    }

    /// Launch the backend with this configuration instead of one derived
    /// from the settings. Pipe mode only.
    pub fn with_launch_config(mut self, launch: BackendLaunchConfig) -> Self {
        self.launch = Some(launch);
        self
    }

    /// Use an already attached pipe instead of spawning the backend.
    ///
    /// Forces pipe mode. The bridge has no supervisor in this case.
    pub fn with_pipe_connection(mut self, connection: Arc<PipeConnection>) -> Self {
        self.settings.use_pipe = true;
        self.connection = Some(connection);
        self
    }

    /// Reconnect schedule for the SSE push stream.
    ///
    /// Default: 5 attempts, attempt N waits N seconds.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build the bridge, spawning the backend in pipe mode.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Bridge> {
        self.settings.validate()?;
        let mode = TransportMode::from_use_pipe(self.settings.use_pipe);
        info!("Building bridge with {} transport", mode);

        let (transport, source, supervisor): (Arc<dyn Transport>, Arc<dyn PushSource>, _) =
            match mode {
                TransportMode::Pipe => {
                    let (connection, supervisor) = match self.connection {
                        Some(connection) => (connection, None),
                        None => {
                            let launch = self
                                .launch
                                .unwrap_or_else(|| BackendLaunchConfig::from_settings(&self.settings));
                            let supervisor = ChildSupervisor::start(&launch)?;
                            (supervisor.connection().clone(), Some(supervisor))
                        }
                    };
                    (
                        Arc::new(PipeTransport::new(connection.clone())),
                        Arc::new(PipePushSource::new(connection)),
                        supervisor,
                    )
                }
                TransportMode::Http => {
                    let http = HttpTransport::new(&self.settings.backend_url)?;
                    let source = SseSource::new(http.client().clone(), http.base_url());
                    (Arc::new(http), Arc::new(source), None)
                }
            };

        Ok(Bridge {
            router: TransportRouter::new(transport),
            push: PushChannel::with_policy(source, self.policy),
            supervisor,
            settings: self.settings,
        })
    }
}
