//! Centralized configuration for the Nutrack bridge.
//!
//! Fixed protocol constants live on the `*Config` structs. Deployment-specific
//! values (backend URL, transport choice, paths) live in [`BridgeSettings`],
//! which reads the same `config.json` the desktop shell ships with.

use crate::error::{BridgeError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Pipe transport constants.
pub struct PipeConfig;

impl PipeConfig {
    /// Budget for every outstanding pipe request. Not configurable per call.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);
    /// Longest unterminated line the codec buffers before discarding it.
    pub const MAX_LINE_BYTES: usize = 1024 * 1024;
    /// Read buffer size for the child's stdout.
    pub const READ_CHUNK_BYTES: usize = 8192;
    /// Capacity of the push-event fan-out from the child.
    pub const PUSH_BUFFER: usize = 256;

    // Environment handed to the child process
    pub const ENV_PIPE_MODE: &'static str = "USE_ELECTRON_IPC";
    pub const ENV_DESKTOP_APP: &'static str = "ELECTRON_APP";
    pub const ENV_DATA_DIR: &'static str = "DATA_DIR";
}

/// Push channel constants.
pub struct PushConfig;

impl PushConfig {
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);
    pub const SSE_PATH: &'static str = "/sse";
    /// Push payload announcing that the local and cloud replicas diverged.
    pub const SYNC_CONFLICT_SENTINEL: &'static str = "SHOW_SYNC_CONFLICT";
    /// Capacity of each SSE client's queue on the backend side.
    pub const SSE_CLIENT_BUFFER: usize = 64;
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const USER_AGENT: &'static str = "Nutrack-Bridge/0.3";
    pub const DEFAULT_BACKEND_URL: &'static str = "http://localhost";
}

/// Shared directory and file names.
pub struct PathsConfig;

impl PathsConfig {
    pub const APP_DIR_NAME: &'static str = "Nutrack";
    pub const DATA_DIR_NAME: &'static str = "data";
    pub const BACKEND_BINARY_NAME: &'static str = "backend";
    pub const DEV_BACKEND_DIR: &'static str = "src/backend/main";
    pub const CONFIG_FILE_NAME: &'static str = "config.json";

    // Environment overrides
    pub const ENV_BACKEND_URL: &'static str = "NUTRACK_BACKEND_URL";
}

/// How the backend executable is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackagingMode {
    /// Running from a source checkout; the backend is built in place.
    #[default]
    Development,
    /// Running from an installed bundle; the backend sits in the resources dir.
    Packaged,
}

impl PackagingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackagingMode::Development => "development",
            PackagingMode::Packaged => "packaged",
        }
    }
}

impl std::fmt::Display for PackagingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// On-disk shape of `config.json`.
#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    #[serde(rename = "BACKEND_URL")]
    backend_url: Option<String>,
    #[serde(rename = "USE_ELECTRON_IPC")]
    use_electron_ipc: Option<String>,
}

/// Runtime settings for a bridge instance.
///
/// The transport choice is resolved once here and never changes for the
/// lifetime of the bridge built from it.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Base URL for HTTP calls and the SSE stream (no trailing slash).
    pub backend_url: String,
    /// `true` routes calls over the child's stdio pipe, `false` over HTTP.
    pub use_pipe: bool,
    pub packaging: PackagingMode,
    /// Writable data directory handed to the child.
    pub data_dir: PathBuf,
    /// Source checkout root, used in development packaging.
    pub project_root: PathBuf,
    /// Bundle resources dir, used in packaged mode.
    pub resources_dir: PathBuf,
    /// Explicit backend executable, bypassing packaging-based resolution.
    pub backend_executable: Option<PathBuf>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            backend_url: NetworkConfig::DEFAULT_BACKEND_URL.to_string(),
            use_pipe: true,
            packaging: PackagingMode::default(),
            data_dir: default_data_dir(),
            project_root: cwd.clone(),
            resources_dir: cwd,
            backend_executable: None,
        }
    }
}

impl BridgeSettings {
    /// Load settings from a `config.json` file.
    ///
    /// A missing file is not an error: the desktop defaults
    /// (`http://localhost`, pipe transport) apply, as they always have.
    /// A present but malformed file is a configuration error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut settings = Self::default();

        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let file: ConfigFile =
                    serde_json::from_str(&contents).map_err(|e| BridgeError::Config {
                        message: format!("Invalid config file {}: {}", path.display(), e),
                    })?;
                debug!("Loaded config from {}", path.display());
                settings.apply_file(file);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "Config file {} not found, using desktop defaults",
                    path.display()
                );
            }
            Err(e) => return Err(BridgeError::io_with_path(e, path)),
        }

        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(url) = file.backend_url {
            self.backend_url = normalize_backend_url(&url);
        }
        if let Some(flag) = file.use_electron_ipc {
            self.use_pipe = flag == "1";
        }
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(PathsConfig::ENV_BACKEND_URL) {
            self.backend_url = normalize_backend_url(&url);
        }
        if let Ok(flag) = std::env::var(PipeConfig::ENV_PIPE_MODE) {
            self.use_pipe = flag == "1";
        }
    }

    /// Check that the backend URL is usable when the HTTP transport is active.
    pub fn validate(&self) -> Result<()> {
        if !self.use_pipe {
            url::Url::parse(&self.backend_url).map_err(|e| BridgeError::Config {
                message: format!("Invalid backend URL {:?}: {}", self.backend_url, e),
            })?;
        }
        Ok(())
    }

    pub fn with_backend_url(mut self, url: impl AsRef<str>) -> Self {
        self.backend_url = normalize_backend_url(url.as_ref());
        self
    }

    pub fn with_pipe(mut self, use_pipe: bool) -> Self {
        self.use_pipe = use_pipe;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_backend_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.backend_executable = Some(path.into());
        self
    }
}

/// Default data directory: `<platform data dir>/Nutrack/data`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(PathsConfig::APP_DIR_NAME)
        .join(PathsConfig::DATA_DIR_NAME)
}

/// Add a scheme when missing and strip trailing slashes.
///
/// The web build stored bare `host:port` values.
fn normalize_backend_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_backend_url() {
        assert_eq!(normalize_backend_url("localhost:8080/"), "http://localhost:8080");
        assert_eq!(
            normalize_backend_url("https://api.example.com/api/"),
            "https://api.example.com/api"
        );
    }

    #[test]
    fn test_config_file_selects_http() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PathsConfig::CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"BACKEND_URL": "127.0.0.1:8080/api", "USE_ELECTRON_IPC": "0"}"#,
        )
        .unwrap();

        let mut settings = BridgeSettings::default();
        let file: ConfigFile =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        settings.apply_file(file);

        assert!(!settings.use_pipe);
        assert_eq!(settings.backend_url, "http://127.0.0.1:8080/api");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_malformed_config_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PathsConfig::CONFIG_FILE_NAME);
        std::fs::write(&path, "{not json").unwrap();

        let result = BridgeSettings::load(&path);
        assert!(matches!(result, Err(BridgeError::Config { .. })));
    }

    #[test]
    fn test_default_data_dir_layout() {
        let dir = default_data_dir();
        assert!(dir.ends_with("Nutrack/data"));
    }

    #[test]
    fn test_timeouts_are_fixed() {
        assert_eq!(PipeConfig::REQUEST_TIMEOUT, Duration::from_secs(30));
        assert_eq!(PushConfig::MAX_RECONNECT_ATTEMPTS, 5);
    }
}
