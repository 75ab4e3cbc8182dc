// Single-command execution over any connection

use std::sync::Arc;
use std::time::Duration;

use super::{CommandOutput, Connection};
use crate::output::errors::ArmadaError;

/// Shared, cloneable sink handed through RunOptions
pub type SharedSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Options for a single command invocation
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Working directory on the target
    pub cwd: Option<String>,
    /// Environment overrides exported before the command
    pub env: Vec<(String, String)>,
    /// Deadline; exceeding it tears down the channel/process
    pub timeout: Option<Duration>,
    /// Incremental output sink for live progress display
    pub sink: Option<SharedSink>,
}

impl RunOptions {
    pub fn new() -> Self {
        RunOptions::default()
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// Executes single commands on a target, local or remote
#[derive(Clone)]
pub struct ProcessRunner {
    default_timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        ProcessRunner { default_timeout }
    }

    /// Run a command; non-zero exit is an error carrying the captured output
    pub async fn run(
        &self,
        conn: &dyn Connection,
        command: &str,
        options: &RunOptions,
    ) -> Result<CommandOutput, ArmadaError> {
        let output = self.run_tolerant(conn, command, options).await?;
        if !output.success() {
            return Err(ArmadaError::Command {
                host: conn.host_alias().to_string(),
                command: command.to_string(),
                exit_code: output.exit_code,
                output: output.combined(),
            });
        }
        Ok(output)
    }

    /// Run a command and return the result regardless of exit status.
    /// Transport and timeout failures still error.
    pub async fn run_tolerant(
        &self,
        conn: &dyn Connection,
        command: &str,
        options: &RunOptions,
    ) -> Result<CommandOutput, ArmadaError> {
        let assembled = assemble_command(command, options);
        let timeout = options.timeout.or(self.default_timeout);

        let sink: Box<dyn Fn(&str) + Send + Sync> = match &options.sink {
            Some(shared) => {
                let shared = shared.clone();
                Box::new(move |chunk: &str| shared(chunk))
            }
            None => Box::new(|_| {}),
        };

        conn.exec_streaming(&assembled, timeout, sink).await
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        ProcessRunner::new(None)
    }
}

/// Prefix the command with env exports and a working-directory change
fn assemble_command(command: &str, options: &RunOptions) -> String {
    let mut parts = Vec::new();

    for (key, value) in &options.env {
        parts.push(format!("export {}={}", key, shell_quote(value)));
    }

    if let Some(cwd) = &options.cwd {
        parts.push(format!("cd {}", shell_quote(cwd)));
    }

    parts.push(command.to_string());
    parts.join(" && ")
}

/// Single-quote a value for sh, escaping embedded single quotes
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LocalConnection;
    use parking_lot::Mutex;

    #[test]
    fn test_assemble_plain() {
        let opts = RunOptions::new();
        assert_eq!(assemble_command("ls", &opts), "ls");
    }

    #[test]
    fn test_assemble_env_and_cwd() {
        let opts = RunOptions::new()
            .with_env("RAILS_ENV", "production")
            .with_cwd("/srv/app");
        assert_eq!(
            assemble_command("bin/deploy", &opts),
            "export RAILS_ENV='production' && cd '/srv/app' && bin/deploy"
        );
    }

    #[test]
    fn test_shell_quote_escapes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_run_success() {
        let runner = ProcessRunner::default();
        let conn = LocalConnection::controller();

        let output = runner
            .run(&conn, "echo ok", &RunOptions::new())
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "ok");
    }

    #[tokio::test]
    async fn test_run_nonzero_is_command_error() {
        let runner = ProcessRunner::default();
        let conn = LocalConnection::controller();

        let err = runner
            .run(&conn, "echo broken >&2; exit 7", &RunOptions::new())
            .await
            .unwrap_err();

        match err {
            ArmadaError::Command {
                exit_code, output, ..
            } => {
                assert_eq!(exit_code, 7);
                assert!(output.contains("broken"));
            }
            other => panic!("expected command error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_tolerant_returns_failure() {
        let runner = ProcessRunner::default();
        let conn = LocalConnection::controller();

        let output = runner
            .run_tolerant(&conn, "exit 7", &RunOptions::new())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 7);
    }

    #[tokio::test]
    async fn test_env_and_cwd_take_effect() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::default();
        let conn = LocalConnection::controller();

        let opts = RunOptions::new()
            .with_env("GREETING", "hello")
            .with_cwd(dir.path().to_str().unwrap());
        let output = runner
            .run(&conn, "echo \"$GREETING from $(pwd)\"", &opts)
            .await
            .unwrap();

        assert!(output.stdout.contains("hello from"));
        assert!(output
            .stdout
            .contains(dir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_timeout_is_timeout_error() {
        let runner = ProcessRunner::default();
        let conn = LocalConnection::controller();

        let opts = RunOptions::new().with_timeout(Duration::from_millis(100));
        let err = runner.run(&conn, "sleep 5", &opts).await.unwrap_err();
        assert!(matches!(err, ArmadaError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_sink_receives_output() {
        let runner = ProcessRunner::default();
        let conn = LocalConnection::controller();

        let seen: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let sink_seen = seen.clone();
        let opts = RunOptions::new()
            .with_sink(Arc::new(move |chunk| sink_seen.lock().push_str(chunk)));

        runner.run(&conn, "echo streamed", &opts).await.unwrap();
        assert!(seen.lock().contains("streamed"));
    }
}
