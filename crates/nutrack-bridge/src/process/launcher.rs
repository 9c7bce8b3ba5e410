//! Backend launch configuration.

use crate::config::{BridgeSettings, PackagingMode, PathsConfig, PipeConfig};
use crate::error::{BridgeError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Configuration for launching the backend child process.
#[derive(Debug, Clone)]
pub struct BackendLaunchConfig {
    /// Path to the backend executable.
    pub executable: PathBuf,
    /// Additional arguments to pass.
    pub args: Vec<String>,
    /// Writable data directory handed to the child.
    pub data_dir: PathBuf,
    /// Extra environment variables, applied before the contractual ones.
    pub env_vars: HashMap<String, String>,
}

impl BackendLaunchConfig {
    pub fn new(executable: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: vec![],
            data_dir: data_dir.into(),
            env_vars: HashMap::new(),
        }
    }

    /// Build a launch config from bridge settings.
    ///
    /// An explicit executable wins; otherwise the path follows the packaging mode.
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        let executable = settings.backend_executable.clone().unwrap_or_else(|| {
            resolve_backend_path(
                settings.packaging,
                &settings.project_root,
                &settings.resources_dir,
            )
        });
        Self::new(executable, &settings.data_dir)
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Environment for the child: extras first, then the variables the
    /// backend relies on to select pipe mode and find its data.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .env_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push((PipeConfig::ENV_PIPE_MODE.to_string(), "1".to_string()));
        env.push((PipeConfig::ENV_DESKTOP_APP.to_string(), "1".to_string()));
        env.push((
            PipeConfig::ENV_DATA_DIR.to_string(),
            self.data_dir.to_string_lossy().into_owned(),
        ));
        env
    }

    /// Create the data directory if it does not exist yet.
    pub fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir).map_err(|e| BridgeError::Io {
                message: format!("Failed to create data directory: {}", self.data_dir.display()),
                path: Some(self.data_dir.clone()),
                source: Some(e),
            })?;
            info!("Created data directory {}", self.data_dir.display());
        }
        Ok(())
    }
}

/// Locate the backend executable for a packaging mode.
///
/// # Platform Behavior
/// - **Development**: `{project_root}/src/backend/main/backend`
/// - **Packaged**: `{resources_dir}/backend`
/// - **Windows**: `.exe` is appended in both modes
pub fn resolve_backend_path(
    packaging: PackagingMode,
    project_root: &Path,
    resources_dir: &Path,
) -> PathBuf {
    let base = match packaging {
        PackagingMode::Development => project_root.join(PathsConfig::DEV_BACKEND_DIR),
        PackagingMode::Packaged => resources_dir.to_path_buf(),
    };

    #[cfg(windows)]
    {
        base.join(format!("{}.exe", PathsConfig::BACKEND_BINARY_NAME))
    }
    #[cfg(not(windows))]
    {
        base.join(PathsConfig::BACKEND_BINARY_NAME)
    }
}
