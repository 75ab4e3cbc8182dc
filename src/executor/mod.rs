// Executor module - connection transports and run machinery

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::output::errors::ArmadaError;

pub mod context;
pub mod local;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod ssh;
pub mod sync;

pub use context::ExecutionContext;
pub use local::LocalConnection;
pub use runner::{ProcessRunner, RunOptions};
pub use scheduler::{CancelHandle, Executor, ExecutorConfig};
pub use ssh::{ConnectionManager, SshConnection};
pub use sync::{FileSync, SyncOptions, SyncResult};

/// Captured result of executing a command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Combined stdout + stderr for error reporting
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Incremental sink for command output as it arrives
pub type OutputSink = Box<dyn Fn(&str) + Send + Sync>;

/// Common trait for all connection types (SSH, local)
///
/// A connection is exclusively owned by the host it was opened for; command
/// execution on it is serialized even when tasks fan out across hosts.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a command and capture its output
    async fn exec(&self, cmd: &str) -> Result<CommandOutput, ArmadaError>;

    /// Execute a command, streaming chunks into the sink as they arrive.
    /// Exceeding the timeout tears down the underlying channel or process.
    async fn exec_streaming(
        &self,
        cmd: &str,
        timeout: Option<Duration>,
        sink: OutputSink,
    ) -> Result<CommandOutput, ArmadaError>;

    /// Upload a local file to the target
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), ArmadaError>;

    /// The alias of the host this connection belongs to
    fn host_alias(&self) -> &str;
}
