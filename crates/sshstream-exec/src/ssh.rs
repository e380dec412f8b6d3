//! SSH transport using the russh crate

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::{PrivateKeyWithHashAlg, ssh_key};
use russh::{Channel, ChannelMsg, Disconnect, client};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::{debug, info, instrument, warn};

use crate::credentials::{Credentials, ResolvedAuth};
use crate::error::{ExecError, StreamKind};
use crate::transport::{Connection, PipeReader, PipeWriter, Session, Transport};

/// Capacity of the in-memory pipes between the channel and the pumps
const PIPE_BUFFER: usize = 64 * 1024;

/// Extended data code for stderr (RFC 4254 section 5.2)
const EXTENDED_DATA_STDERR: u32 = 1;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler {
    host_fingerprint: Option<String>,
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(expected) = &self.host_fingerprint else {
            // Accept all server keys (like StrictHostKeyChecking=no)
            return Ok(true);
        };

        let actual = server_public_key
            .fingerprint(ssh_key::HashAlg::Sha256)
            .to_string();
        if &actual == expected {
            Ok(true)
        } else {
            warn!(expected = %expected, actual = %actual, "host key fingerprint mismatch");
            Ok(false)
        }
    }
}

/// Dials SSH connections
#[derive(Debug, Clone)]
pub struct SshTransport {
    config: Arc<client::Config>,
    host_fingerprint: Option<String>,
}

impl SshTransport {
    /// Create a transport that accepts any host key
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config::default()),
            host_fingerprint: None,
        }
    }

    /// Only accept a server presenting this SHA-256 host key fingerprint (`SHA256:...`)
    #[must_use]
    pub fn with_host_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.host_fingerprint = Some(fingerprint.into());
        self
    }
}

impl Default for SshTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SshTransport {
    type Connection = SshConnection;

    #[instrument(skip(self, credentials), fields(user = %credentials.user))]
    async fn dial(
        &self,
        address: &str,
        port: u16,
        credentials: &Credentials,
    ) -> Result<SshConnection, ExecError> {
        let auth = credentials.resolve()?;

        info!(address = %address, port = port, "connecting to SSH");

        let handler = SshClientHandler {
            host_fingerprint: self.host_fingerprint.clone(),
        };
        let mut handle = client::connect(self.config.clone(), (address, port), handler)
            .await
            .map_err(|e| match e {
                russh::Error::UnknownKey => {
                    ExecError::AuthenticationFailed("server host key rejected".to_string())
                }
                other => ExecError::ConnectionFailed(other.to_string()),
            })?;

        let auth_res = match auth {
            ResolvedAuth::Key(key) => {
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                handle
                    .authenticate_publickey(
                        &credentials.user,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
            }
            ResolvedAuth::Password(password) => {
                handle
                    .authenticate_password(&credentials.user, password)
                    .await
            }
        }
        .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(format!(
                "server rejected credentials for {}",
                credentials.user
            )));
        }

        info!(address = %address, "SSH connected and authenticated");

        Ok(SshConnection {
            handle: Some(handle),
            address: address.to_string(),
        })
    }
}

/// Authenticated SSH connection
pub struct SshConnection {
    handle: Option<client::Handle<SshClientHandler>>,
    address: String,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("address", &self.address)
            .field("connected", &self.handle.is_some())
            .finish()
    }
}

#[async_trait]
impl Connection for SshConnection {
    type Session = SshSession;

    async fn new_session(&mut self) -> Result<SshSession, ExecError> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| ExecError::SessionFailed("connection closed".to_string()))?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::SessionFailed(e.to_string()))?;

        debug!(address = %self.address, "session channel opened");
        Ok(SshSession::new(channel))
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        if let Some(handle) = self.handle.take() {
            handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::Transport(e.to_string()))?;
            info!(address = %self.address, "SSH disconnected");
        }
        Ok(())
    }
}

/// How the remote process ended
enum Exit {
    Status(u32),
    Signal(String),
}

/// Session channel running a single command
///
/// Pipes are in-memory duplex streams. `run` owns the channel's message
/// loop and copies between the channel and the session-side pipe ends.
pub struct SshSession {
    channel: Option<Channel<client::Msg>>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    stdin: Option<DuplexStream>,
    started: bool,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("open", &self.channel.is_some())
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl SshSession {
    fn new(channel: Channel<client::Msg>) -> Self {
        Self {
            channel: Some(channel),
            stdout: None,
            stderr: None,
            stdin: None,
            started: false,
        }
    }

    fn check_pipe(&self, stream: StreamKind, taken: bool) -> Result<(), ExecError> {
        if self.channel.is_none() {
            return Err(ExecError::pipe(stream, "session closed"));
        }
        if self.started {
            return Err(ExecError::pipe(stream, "command already started"));
        }
        if taken {
            return Err(ExecError::pipe(stream, "pipe already requested"));
        }
        Ok(())
    }
}

#[async_trait]
impl Session for SshSession {
    fn stdout_pipe(&mut self) -> Result<PipeReader, ExecError> {
        self.check_pipe(StreamKind::Stdout, self.stdout.is_some())?;
        let (reader, writer) = tokio::io::duplex(PIPE_BUFFER);
        self.stdout = Some(writer);
        Ok(Box::new(reader))
    }

    fn stderr_pipe(&mut self) -> Result<PipeReader, ExecError> {
        self.check_pipe(StreamKind::Stderr, self.stderr.is_some())?;
        let (reader, writer) = tokio::io::duplex(PIPE_BUFFER);
        self.stderr = Some(writer);
        Ok(Box::new(reader))
    }

    fn stdin_pipe(&mut self) -> Result<PipeWriter, ExecError> {
        self.check_pipe(StreamKind::Stdin, self.stdin.is_some())?;
        let (reader, writer) = tokio::io::duplex(PIPE_BUFFER);
        self.stdin = Some(reader);
        Ok(Box::new(writer))
    }

    #[instrument(skip(self))]
    async fn run(&mut self, command: &str) -> Result<(), ExecError> {
        if self.started {
            return Err(ExecError::Transport(
                "session already ran a command".to_string(),
            ));
        }
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| ExecError::Transport("session closed".to_string()))?;
        self.started = true;

        channel
            .exec(true, command)
            .await
            .map_err(|e| ExecError::Transport(e.to_string()))?;

        let mut stdout = self.stdout.take();
        let mut stderr = self.stderr.take();
        let mut stdin = self.stdin.take();

        if stdin.is_none() {
            channel
                .eof()
                .await
                .map_err(|e| ExecError::Transport(e.to_string()))?;
        }

        let mut buf = vec![0u8; PIPE_BUFFER];
        let mut exit = None;

        loop {
            tokio::select! {
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        forward(&mut stdout, &data, StreamKind::Stdout).await;
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext == EXTENDED_DATA_STDERR {
                            forward(&mut stderr, &data, StreamKind::Stderr).await;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit = Some(Exit::Status(exit_status));
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        exit = Some(Exit::Signal(format!("{signal_name:?}")));
                    }
                    Some(ChannelMsg::Eof) => {
                        // no more output; let the pumps see end-of-stream
                        stdout = None;
                        stderr = None;
                    }
                    Some(_) => {}
                    None => break,
                },
                read = read_pipe(&mut stdin, &mut buf) => match read {
                    Ok(0) => {
                        stdin = None;
                        channel
                            .eof()
                            .await
                            .map_err(|e| ExecError::Transport(e.to_string()))?;
                    }
                    Ok(n) => {
                        channel
                            .data(&buf[..n])
                            .await
                            .map_err(|e| ExecError::Transport(e.to_string()))?;
                    }
                    Err(e) => {
                        debug!(error = %e, "stdin pipe read failed");
                        stdin = None;
                        channel
                            .eof()
                            .await
                            .map_err(|e| ExecError::Transport(e.to_string()))?;
                    }
                },
            }
        }

        match exit {
            Some(Exit::Status(0)) => {
                debug!("remote command succeeded");
                Ok(())
            }
            Some(Exit::Status(status)) => Err(ExecError::CommandFailed { status }),
            Some(Exit::Signal(signal)) => Err(ExecError::Signaled { signal }),
            None => Err(ExecError::Transport(
                "channel closed without exit status".to_string(),
            )),
        }
    }

    async fn close(&mut self) -> Result<(), ExecError> {
        self.stdout = None;
        self.stderr = None;
        self.stdin = None;
        if let Some(channel) = self.channel.take() {
            // the server usually closed the channel already
            if let Err(e) = channel.close().await {
                debug!(error = %e, "channel close ignored");
            }
        }
        Ok(())
    }
}

/// Copy channel data into a session-side pipe end
///
/// A pipe whose reader went away is dropped and further data discarded.
async fn forward(pipe: &mut Option<DuplexStream>, data: &[u8], stream: StreamKind) {
    let Some(writer) = pipe.as_mut() else {
        return;
    };
    if let Err(e) = writer.write_all(data).await {
        debug!(%stream, error = %e, "discarding remote output");
        *pipe = None;
    }
}

/// Read from the stdin pipe, or wait forever if it is not wired
async fn read_pipe(pipe: &mut Option<DuplexStream>, buf: &mut [u8]) -> io::Result<usize> {
    match pipe {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::executor::CommandExecutor;

    #[test]
    fn test_transport_defaults() {
        let transport = SshTransport::new();
        assert!(transport.host_fingerprint.is_none());

        let pinned = transport.with_host_fingerprint("SHA256:abc");
        assert_eq!(pinned.host_fingerprint.as_deref(), Some("SHA256:abc"));
    }

    #[tokio::test]
    async fn test_connection_close_is_idempotent() {
        let mut connection = SshConnection {
            handle: None,
            address: "192.0.2.1".to_string(),
        };

        assert!(connection.close().await.is_ok());
        assert!(connection.close().await.is_ok());
        assert!(matches!(
            connection.new_session().await,
            Err(ExecError::SessionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_session_rejects_use() {
        let mut session = SshSession {
            channel: None,
            stdout: None,
            stderr: None,
            stdin: None,
            started: false,
        };

        assert!(session.close().await.is_ok());
        assert!(session.close().await.is_ok());
        assert!(matches!(
            session.stdout_pipe(),
            Err(ExecError::PipeFailed { stream: StreamKind::Stdout, .. })
        ));
        assert!(matches!(session.run("ls").await, Err(ExecError::Transport(_))));
    }

    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_ssh_echo() {
        let user = std::env::var("SSHSTREAM_TEST_USER").unwrap();
        let host = std::env::var("SSHSTREAM_TEST_HOST").unwrap();
        let key = std::env::var("SSHSTREAM_TEST_KEY").unwrap();

        let config = ExecutorConfig::new(
            host,
            Credentials::with_key(user, crate::credentials::KeySource::path(key)),
        );
        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        let mut executor = CommandExecutor::new(config, SshTransport::new()).with_stdout(tx);

        executor.execute("echo hello").await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("hello\n"));
    }
}
