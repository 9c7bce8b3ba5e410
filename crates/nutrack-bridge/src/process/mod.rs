//! Backend child process management.
//!
//! - **Launcher**: executable resolution and the child's environment
//! - **Pipe**: framed request/response/push traffic over the child's stdio
//! - **Supervisor**: spawn, stderr logging, exit observation and termination

pub mod launcher;
pub mod pipe;
pub mod supervisor;

pub use launcher::{resolve_backend_path, BackendLaunchConfig};
pub use pipe::PipeConnection;
pub use supervisor::{BackendExit, ChildSupervisor};
