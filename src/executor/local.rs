// Controller-side command execution without SSH

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{CommandOutput, Connection, OutputSink};
use crate::output::errors::ArmadaError;

/// Connection to the controller itself (local-mode tasks, localhost hosts)
pub struct LocalConnection {
    host_alias: String,
}

impl LocalConnection {
    pub fn new(host_alias: impl Into<String>) -> Self {
        LocalConnection {
            host_alias: host_alias.into(),
        }
    }

    /// The implicit controller target used by local-mode tasks
    pub fn controller() -> Self {
        LocalConnection::new("localhost")
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandOutput, ArmadaError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .await
            .map_err(|e| ArmadaError::Io {
                message: format!("failed to execute local command: {}", e),
                path: None,
            })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn exec_streaming(
        &self,
        cmd: &str,
        timeout: Option<Duration>,
        sink: OutputSink,
    ) -> Result<CommandOutput, ArmadaError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ArmadaError::Io {
                message: format!("failed to spawn local command: {}", e),
                path: None,
            })?;

        let stdout_handle = child.stdout.take().ok_or_else(|| ArmadaError::Io {
            message: "failed to capture stdout".to_string(),
            path: None,
        })?;
        let stderr_handle = child.stderr.take().ok_or_else(|| ArmadaError::Io {
            message: "failed to capture stderr".to_string(),
            path: None,
        })?;

        let sink = Arc::new(sink);

        let out_sink = sink.clone();
        let stdout_task = tokio::spawn(async move {
            let mut captured = String::new();
            let mut reader = BufReader::new(stdout_handle);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        out_sink(&line);
                        captured.push_str(&line);
                    }
                    Err(_) => break,
                }
            }
            captured
        });

        let err_sink = sink.clone();
        let stderr_task = tokio::spawn(async move {
            let mut captured = String::new();
            let mut reader = BufReader::new(stderr_handle);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        err_sink(&line);
                        captured.push_str(&line);
                    }
                    Err(_) => break,
                }
            }
            captured
        });

        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    child.kill().await.ok();
                    return Err(ArmadaError::Timeout {
                        host: self.host_alias.clone(),
                        operation: cmd.to_string(),
                        duration_secs: limit.as_secs(),
                    });
                }
            },
            None => child.wait().await,
        }
        .map_err(|e| ArmadaError::Io {
            message: format!("failed to wait for command: {}", e),
            path: None,
        })?;

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
        })
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), ArmadaError> {
        if let Some(parent) = Path::new(remote).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ArmadaError::Io {
                    message: format!("failed to create directory: {}", e),
                    path: Some(parent.to_path_buf()),
                })?;
        }
        tokio::fs::copy(local, remote)
            .await
            .map_err(|e| ArmadaError::Io {
                message: format!("failed to copy file: {}", e),
                path: Some(local.to_path_buf()),
            })?;
        Ok(())
    }

    fn host_alias(&self) -> &str {
        &self.host_alias
    }
}
