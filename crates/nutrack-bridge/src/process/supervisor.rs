//! Lifecycle of the single backend child process.
//!
//! The supervisor spawns the backend with piped stdio and hands
//! stdin/stdout to a [`PipeConnection`]. Stderr is logged. A watcher task
//! observes the exit. There is no restart: once the child is gone every
//! call fails fast until the host is relaunched.

use super::launcher::BackendLaunchConfig;
use super::pipe::PipeConnection;
use crate::error::{BridgeError, Result};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// How long a terminated child gets before it is force-killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How the backend process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendExit {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
}

/// Owner of the backend child process.
pub struct ChildSupervisor {
    pid: Option<u32>,
    connection: Arc<PipeConnection>,
    exit_rx: watch::Receiver<Option<BackendExit>>,
    terminate_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ChildSupervisor {
    /// Spawn the backend and wire its streams.
    ///
    /// Creates the data directory first. Must be called from within a tokio
    /// runtime.
    pub fn start(config: &BackendLaunchConfig) -> Result<Self> {
        config.ensure_data_dir()?;

        info!("Starting backend from: {}", config.executable.display());
        info!("Data directory: {}", config.data_dir.display());

        let mut child = Command::new(&config.executable)
            .args(&config.args)
            .envs(config.child_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::LaunchFailed {
                path: config.executable.clone(),
                message: e.to_string(),
            })?;

        let missing = |stream: &str| BridgeError::LaunchFailed {
            path: config.executable.clone(),
            message: format!("backend {} was not piped", stream),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let pid = child.id();
        debug!("Backend spawned with PID {:?}", pid);

        let connection = Arc::new(PipeConnection::attach(stdin, stdout));
        tokio::spawn(Self::stderr_loop(stderr));

        let (exit_tx, exit_rx) = watch::channel(None);
        let (terminate_tx, terminate_rx) = oneshot::channel();
        tokio::spawn(Self::watch_exit(
            child,
            terminate_rx,
            exit_tx,
            connection.clone(),
        ));

        Ok(Self {
            pid,
            connection,
            exit_rx,
            terminate_tx: Mutex::new(Some(terminate_tx)),
        })
    }

    async fn stderr_loop(stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(target: "nutrack_bridge::backend", "{}", line),
                Ok(None) => break,
                Err(e) => {
                    debug!("Backend stderr read failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn watch_exit(
        mut child: Child,
        terminate_rx: oneshot::Receiver<()>,
        exit_tx: watch::Sender<Option<BackendExit>>,
        connection: Arc<PipeConnection>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            // An explicit terminate, or the supervisor was dropped.
            _ = terminate_rx => {
                signal_terminate(&mut child);
                match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        warn!("Backend ignored termination, killing it");
                        let _ = child.start_kill();
                        child.wait().await
                    }
                }
            }
        };

        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                error!("Failed to wait for backend process: {}", e);
                None
            }
        };

        info!("Backend process exited with code {:?}", code);
        // Stdout can outlive the child when a grandchild inherited it.
        connection.mark_exited(code);
        let _ = exit_tx.send(Some(BackendExit { code }));
    }

    pub fn connection(&self) -> &Arc<PipeConnection> {
        &self.connection
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// How the child ended, if it has.
    pub fn exit(&self) -> Option<BackendExit> {
        *self.exit_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit().is_none() && self.connection.is_open()
    }

    /// Wait until the child has exited.
    pub async fn wait_for_exit(&self) -> Option<BackendExit> {
        let mut rx = self.exit_rx.clone();
        let exit = rx.wait_for(Option::is_some).await.ok().and_then(|exit| *exit);
        if let Some(exit) = exit {
            self.connection.mark_exited(exit.code);
        }
        exit
    }

    /// Ask the child to terminate and return immediately.
    ///
    /// The watcher task escalates to a kill if the child is still alive after
    /// a short grace period. Calling this more than once is harmless.
    pub fn terminate(&self) {
        let tx = self
            .terminate_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            debug!("Terminating backend process {:?}", self.pid);
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for ChildSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSupervisor")
            .field("pid", &self.pid)
            .field("exit", &self.exit())
            .finish()
    }
}

/// Send a graceful termination request to the child.
///
/// # Platform Behavior
/// - **Linux/macOS**: `SIGTERM`
/// - **Windows**: immediate kill (no graceful signal exists for console children)
fn signal_terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to backend {}: {}", pid, e);
                let _ = child.start_kill();
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill backend: {}", e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::PipeConfig;
    use crate::protocol::FramedMessage;
    use serde_json::json;
    use tempfile::TempDir;

    fn shell(script: &str, data_dir: &std::path::Path) -> BackendLaunchConfig {
        BackendLaunchConfig::new("/bin/sh", data_dir)
            .with_arg("-c")
            .with_arg(script)
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_failure() {
        let temp = TempDir::new().unwrap();
        let config = BackendLaunchConfig::new(temp.path().join("no-such-backend"), temp.path());

        let result = ChildSupervisor::start(&config);
        assert!(matches!(result, Err(BridgeError::LaunchFailed { .. })));
    }

    #[tokio::test]
    async fn test_child_receives_env_and_data_dir_is_created() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path().join("data");
        let config = shell(
            r#"printf '{"type":"push-event","data":"%s:%s"}\n' "$USE_ELECTRON_IPC" "$DATA_DIR""#,
            &data_dir,
        );

        let supervisor = ChildSupervisor::start(&config).unwrap();
        let mut pushes = supervisor.connection().subscribe_push();

        let pushed = pushes.recv().await.unwrap();
        assert_eq!(pushed, json!(format!("1:{}", data_dir.display())));
        assert!(data_dir.is_dir());
    }

    #[tokio::test]
    async fn test_exit_fails_pending_and_later_sends() {
        let temp = TempDir::new().unwrap();
        let config = shell("read line; exit 3", temp.path());

        let supervisor = ChildSupervisor::start(&config).unwrap();
        let call = supervisor
            .connection()
            .pending()
            .register("x", PipeConfig::REQUEST_TIMEOUT)
            .unwrap();
        supervisor
            .connection()
            .send(&FramedMessage::request("x", "GET", "/profiles", json!({"urlParams": []})))
            .unwrap();

        assert!(matches!(
            call.wait().await,
            Err(BridgeError::ChildProcessExited { .. })
        ));

        let exit = supervisor.wait_for_exit().await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!supervisor.is_running());
        assert!(matches!(
            supervisor
                .connection()
                .send(&FramedMessage::request("y", "GET", "/profiles", json!({}))),
            Err(BridgeError::TransportUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_exit_closes_pipe_while_stdout_stays_open() {
        use crate::transport::{LogicalRequest, PipeTransport, Transport};

        let temp = TempDir::new().unwrap();
        // The background sleep inherits stdout and keeps it open.
        let config = shell("sleep 5 & read line; exit 3", temp.path());

        let supervisor = ChildSupervisor::start(&config).unwrap();
        let transport = PipeTransport::new(supervisor.connection().clone());

        let err = transport
            .send(&LogicalRequest::get("/profiles"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ChildProcessExited { code: Some(3) }
        ));

        let mut exit_rx = supervisor.exit_rx.clone();
        tokio::time::timeout(Duration::from_secs(5), exit_rx.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap();

        assert!(!supervisor.connection().is_open());
        assert!(matches!(
            transport.send(&LogicalRequest::get("/profiles")).await,
            Err(BridgeError::TransportUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminate_is_fire_and_forget() {
        let temp = TempDir::new().unwrap();
        let config = shell("while true; do sleep 1; done", temp.path());

        let supervisor = ChildSupervisor::start(&config).unwrap();
        assert!(supervisor.is_running());

        supervisor.terminate();
        supervisor.terminate();

        let exit = tokio::time::timeout(Duration::from_secs(10), supervisor.wait_for_exit())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit.code, None);
    }
}
