// SSH connection management with one multiplexed session per host

use std::io::Read;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use ssh2::Session;
use tracing::{debug, warn};

use super::retry::backoff_delay;
use super::{CommandOutput, Connection, OutputSink};
use crate::output::errors::ArmadaError;
use crate::registry::Host;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(15);

/// Maintains one reusable session per host for the duration of a run.
///
/// Repeated commands against the same host reuse the established session and
/// avoid renegotiation cost. A session is owned by its host and never shared
/// across hosts.
pub struct ConnectionManager {
    sessions: DashMap<String, Arc<SshConnection>>,
    connect_timeout: Duration,
    connect_retries: u32,
    default_user: Option<String>,
    default_identity: Option<String>,
    password: Option<String>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        ConnectionManager {
            sessions: DashMap::new(),
            connect_timeout: Duration::from_secs(30),
            connect_retries: 3,
            default_user: None,
            default_identity: None,
            password: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn with_default_user(mut self, user: String) -> Self {
        self.default_user = Some(user);
        self
    }

    pub fn with_default_identity(mut self, path: String) -> Self {
        self.default_identity = Some(path);
        self
    }

    pub fn with_password(mut self, password: String) -> Self {
        self.password = Some(password);
        self
    }

    /// Open (or reuse) the session for a host.
    ///
    /// Localhost hosts get a process-spawning connection instead of SSH.
    pub fn open(&self, host: &Host) -> Result<Arc<dyn Connection>, ArmadaError> {
        if host.is_local() {
            return Ok(Arc::new(super::LocalConnection::new(host.alias.clone())));
        }

        if let Some(existing) = self.sessions.get(&host.alias) {
            return Ok(existing.clone() as Arc<dyn Connection>);
        }

        let conn = Arc::new(self.connect_with_retry(host)?);
        self.sessions.insert(host.alias.clone(), conn.clone());
        Ok(conn as Arc<dyn Connection>)
    }

    /// Number of live SSH sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Tear down the session for one host
    pub fn close(&self, alias: &str) {
        self.sessions.remove(alias);
    }

    /// Tear down every session at run end
    pub fn close_all(&self) {
        self.sessions.clear();
    }

    fn connect_with_retry(&self, host: &Host) -> Result<SshConnection, ArmadaError> {
        let mut last_err = None;

        for attempt in 0..=self.connect_retries {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1, BACKOFF_BASE, BACKOFF_MAX, true);
                warn!(
                    host = %host.alias,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting after failure"
                );
                std::thread::sleep(delay);
            }

            match self.connect(host) {
                Ok(conn) => {
                    debug!(host = %host.alias, attempt, "ssh session established");
                    return Ok(conn);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| ArmadaError::Connection {
            host: host.alias.clone(),
            message: "connection failed".to_string(),
            suggestion: None,
        }))
    }

    fn connect(&self, host: &Host) -> Result<SshConnection, ArmadaError> {
        let address = format!("{}:{}", host.address, host.port);

        let tcp = TcpStream::connect_timeout(
            &address.parse().map_err(|e| ArmadaError::Connection {
                host: host.alias.clone(),
                message: format!("invalid address '{}': {}", address, e),
                suggestion: Some("check the host address in your configuration".to_string()),
            })?,
            self.connect_timeout,
        )
        .map_err(|e| ArmadaError::Connection {
            host: host.alias.clone(),
            message: format!("connection failed: {}", e),
            suggestion: connection_suggestion(&e),
        })?;

        let mut session = Session::new().map_err(|e| ArmadaError::Connection {
            host: host.alias.clone(),
            message: format!("failed to create SSH session: {}", e),
            suggestion: None,
        })?;

        session.set_tcp_stream(tcp);
        session.set_timeout(self.connect_timeout.as_millis() as u32);

        session.handshake().map_err(|e| ArmadaError::Connection {
            host: host.alias.clone(),
            message: format!("SSH handshake failed: {}", e),
            suggestion: Some("check that the SSH service is running on the target".to_string()),
        })?;

        let user = if host.user.is_empty() {
            self.default_user
                .clone()
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "root".to_string())
        } else {
            host.user.clone()
        };

        self.authenticate(&session, host, &user)?;

        Ok(SshConnection {
            session,
            exec_lock: Mutex::new(()),
            host_alias: host.alias.clone(),
        })
    }

    fn authenticate(
        &self,
        session: &Session,
        host: &Host,
        user: &str,
    ) -> Result<(), ArmadaError> {
        // Agent first
        if let Ok(mut agent) = session.agent() {
            if agent.connect().is_ok() {
                agent.list_identities().ok();
                for identity in agent.identities().unwrap_or_default() {
                    if agent.userauth(user, &identity).is_ok() {
                        return Ok(());
                    }
                }
            }
        }

        // Host-pinned identity, then the configured default, then common key files
        let key_paths: Vec<String> = host
            .identity
            .iter()
            .chain(self.default_identity.iter())
            .cloned()
            .chain(
                [
                    home_dir().map(|h| h.join(".ssh/id_ed25519").to_string_lossy().to_string()),
                    home_dir().map(|h| h.join(".ssh/id_rsa").to_string_lossy().to_string()),
                ]
                .into_iter()
                .flatten(),
            )
            .collect();

        for key_path in key_paths {
            if Path::new(&key_path).exists()
                && session
                    .userauth_pubkey_file(user, None, Path::new(&key_path), None)
                    .is_ok()
            {
                return Ok(());
            }
        }

        if let Some(ref password) = self.password {
            if session.userauth_password(user, password).is_ok() {
                return Ok(());
            }
        }

        Err(ArmadaError::Connection {
            host: host.alias.clone(),
            message: "authentication failed".to_string(),
            suggestion: Some(
                "add your key to the SSH agent, pin an identity for this host, or use --ask-pass"
                    .to_string(),
            ),
        })
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// An established, multiplexed SSH session for one host.
///
/// The exec lock serializes commands on this session: tasks fan out across
/// hosts, never across commands on the same host.
pub struct SshConnection {
    session: Session,
    exec_lock: Mutex<()>,
    host_alias: String,
}

impl SshConnection {
    fn exec_blocking(&self, command: &str) -> Result<CommandOutput, ArmadaError> {
        let _guard = self.exec_lock.lock();

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| self.channel_error("failed to open channel", e))?;

        channel
            .exec(command)
            .map_err(|e| self.channel_error("failed to execute command", e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        channel.read_to_string(&mut stdout).ok();
        channel.stderr().read_to_string(&mut stderr).ok();

        channel.wait_close().ok();
        let exit_code = channel.exit_status().unwrap_or(-1);

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn exec_streaming_blocking(
        &self,
        command: &str,
        timeout: Option<Duration>,
        sink: &OutputSink,
    ) -> Result<CommandOutput, ArmadaError> {
        let _guard = self.exec_lock.lock();

        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| self.channel_error("failed to open channel", e))?;

        channel
            .exec(command)
            .map_err(|e| self.channel_error("failed to execute command", e))?;

        self.session.set_blocking(false);

        let start = Instant::now();
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stdout_buf = [0u8; 4096];
        let mut stderr_buf = [0u8; 4096];
        let mut stdout_pending: Vec<u8> = Vec::new();
        let mut stderr_pending: Vec<u8> = Vec::new();

        loop {
            if let Some(limit) = timeout {
                if start.elapsed() > limit {
                    // Tear the channel down so the remote side stops too
                    self.session.set_blocking(true);
                    channel.close().ok();
                    return Err(ArmadaError::Timeout {
                        host: self.host_alias.clone(),
                        operation: command.to_string(),
                        duration_secs: limit.as_secs(),
                    });
                }
            }

            let mut activity = false;

            match channel.read(&mut stdout_buf) {
                Ok(0) => {}
                Ok(n) => {
                    stdout_pending.extend_from_slice(&stdout_buf[..n]);
                    let chunk = decode_ready(&mut stdout_pending);
                    if !chunk.is_empty() {
                        sink(&chunk);
                        stdout.push_str(&chunk);
                    }
                    activity = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }

            match channel.stderr().read(&mut stderr_buf) {
                Ok(0) => {}
                Ok(n) => {
                    stderr_pending.extend_from_slice(&stderr_buf[..n]);
                    let chunk = decode_ready(&mut stderr_pending);
                    if !chunk.is_empty() {
                        sink(&chunk);
                        stderr.push_str(&chunk);
                    }
                    activity = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }

            if channel.eof() {
                break;
            }

            if !activity {
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        self.session.set_blocking(true);
        channel.wait_close().ok();

        // A stream that ended on a split character still delivers its tail
        for (pending, captured) in [
            (&stdout_pending, &mut stdout),
            (&stderr_pending, &mut stderr),
        ] {
            if !pending.is_empty() {
                let tail = String::from_utf8_lossy(pending);
                sink(&tail);
                captured.push_str(&tail);
            }
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code: channel.exit_status().unwrap_or(-1),
        })
    }

    fn upload_blocking(&self, local: &Path, remote: &str) -> Result<(), ArmadaError> {
        let _guard = self.exec_lock.lock();

        let content = std::fs::read(local).map_err(|e| ArmadaError::Io {
            message: format!("failed to read local file: {}", e),
            path: Some(local.to_path_buf()),
        })?;

        let sftp = self.session.sftp().map_err(|e| ArmadaError::Connection {
            host: self.host_alias.clone(),
            message: format!("failed to open SFTP: {}", e),
            suggestion: None,
        })?;

        let mut remote_file =
            sftp.create(Path::new(remote))
                .map_err(|e| ArmadaError::Connection {
                    host: self.host_alias.clone(),
                    message: format!("failed to create remote file '{}': {}", remote, e),
                    suggestion: None,
                })?;

        use std::io::Write;
        remote_file
            .write_all(&content)
            .map_err(|e| ArmadaError::Connection {
                host: self.host_alias.clone(),
                message: format!("failed to write remote file '{}': {}", remote, e),
                suggestion: None,
            })?;

        Ok(())
    }

    fn channel_error(&self, context: &str, e: ssh2::Error) -> ArmadaError {
        // Timeouts and broken pipes mean the session is bad and should be
        // discarded by the manager rather than reused
        let is_connection_error = e.to_string().contains("timeout")
            || e.to_string().contains("Connection")
            || e.to_string().contains("Broken pipe");

        ArmadaError::Connection {
            host: self.host_alias.clone(),
            message: format!("{}: {}", context, e),
            suggestion: if is_connection_error {
                Some("the session will be discarded and reopened".to_string())
            } else {
                None
            },
        }
    }
}

#[async_trait::async_trait]
impl Connection for SshConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandOutput, ArmadaError> {
        self.exec_blocking(cmd)
    }

    async fn exec_streaming(
        &self,
        cmd: &str,
        timeout: Option<Duration>,
        sink: OutputSink,
    ) -> Result<CommandOutput, ArmadaError> {
        self.exec_streaming_blocking(cmd, timeout, &sink)
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), ArmadaError> {
        self.upload_blocking(local, remote)
    }

    fn host_alias(&self) -> &str {
        &self.host_alias
    }
}

/// Decode the complete UTF-8 prefix of the buffer, leaving a trailing split
/// character for the next read. Truly invalid bytes decode lossily.
fn decode_ready(pending: &mut Vec<u8>) -> String {
    let split = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        // error_len of None means the buffer ends mid-character
        Err(e) => match e.error_len() {
            None => e.valid_up_to(),
            Some(_) => pending.len(),
        },
    };

    let chunk = String::from_utf8_lossy(&pending[..split]).into_owned();
    pending.drain(..split);
    chunk
}

fn connection_suggestion(e: &std::io::Error) -> Option<String> {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Some("check that the SSH service is running on the target host".to_string())
        }
        std::io::ErrorKind::TimedOut => {
            Some("check network connectivity and firewall rules".to_string())
        }
        std::io::ErrorKind::PermissionDenied => {
            Some("check SSH key permissions and authentication".to_string())
        }
        _ => None,
    }
}

fn home_dir() -> Option<std::path::PathBuf> {
    std::env::var("HOME").ok().map(std::path::PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_hosts_bypass_ssh() {
        let manager = ConnectionManager::new();
        let host = Host::new("ctl").with_address("127.0.0.1");

        let conn = manager.open(&host).unwrap();
        assert_eq!(conn.host_alias(), "ctl");
        // No SSH session was cached for a local host
        assert!(manager.sessions.is_empty());
    }

    #[test]
    fn test_connect_failure_carries_host_and_suggestion() {
        let manager = ConnectionManager::new()
            .with_connect_timeout(Duration::from_millis(200))
            .with_connect_retries(0);

        // Unresolvable address shape fails before any TCP dial
        let host = Host::new("web1").with_address("not an address");
        match manager.open(&host).map(|_| ()) {
            Err(ArmadaError::Connection { host, .. }) => assert_eq!(host, "web1"),
            Err(other) => panic!("expected connection error, got {:?}", other),
            Ok(()) => panic!("expected connection error"),
        }
    }

    #[test]
    fn test_decode_ready_carries_split_character() {
        let bytes = "héllo".as_bytes();

        // first read ends in the middle of the two-byte 'é'
        let mut pending = bytes[..2].to_vec();
        assert_eq!(decode_ready(&mut pending), "h");
        assert_eq!(pending.len(), 1);

        // the next read completes it without losing anything
        pending.extend_from_slice(&bytes[2..]);
        assert_eq!(decode_ready(&mut pending), "éllo");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_decode_ready_invalid_bytes_are_lossy() {
        let mut pending = vec![b'o', b'k', 0xff, b'!'];
        let chunk = decode_ready(&mut pending);
        assert!(chunk.starts_with("ok"));
        assert!(chunk.ends_with('!'));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let manager = ConnectionManager::new();
        manager.close("web1");
        manager.close_all();
    }
}
