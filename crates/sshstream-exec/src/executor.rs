//! Command executor: runs one remote command with live stream pumps

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::ExecutorConfig;
use crate::error::{ExecError, StreamErrors, StreamKind};
use crate::pump::{self, Pump};
use crate::transport::{Connection, Session, Transport};

/// Runs a single command over a transport and streams its I/O
///
/// Each stream is opt-in: only the channels handed over with `with_stdout`,
/// `with_stderr` and `with_stdin` get a pump. Channels are consumed by the
/// first `execute` call that uses them.
pub struct CommandExecutor<T: Transport> {
    config: ExecutorConfig,
    transport: T,
    stdout: Option<mpsc::Sender<String>>,
    stderr: Option<mpsc::Sender<String>>,
    stdin: Option<mpsc::Receiver<String>>,
}

impl<T: Transport> std::fmt::Debug for CommandExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("config", &self.config)
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> CommandExecutor<T> {
    /// Create an executor with no streams wired
    pub fn new(config: ExecutorConfig, transport: T) -> Self {
        Self {
            config,
            transport,
            stdout: None,
            stderr: None,
            stdin: None,
        }
    }

    /// Forward stdout lines to `tx`
    #[must_use]
    pub fn with_stdout(mut self, tx: mpsc::Sender<String>) -> Self {
        self.stdout = Some(tx);
        self
    }

    /// Forward stderr lines to `tx`
    #[must_use]
    pub fn with_stderr(mut self, tx: mpsc::Sender<String>) -> Self {
        self.stderr = Some(tx);
        self
    }

    /// Feed strings received on `rx` to the command's stdin
    ///
    /// The command sees end-of-input once the sender side is dropped.
    #[must_use]
    pub fn with_stdin(mut self, rx: mpsc::Receiver<String>) -> Self {
        self.stdin = Some(rx);
        self
    }

    /// Get executor configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `command` on the remote host
    ///
    /// Connection and session are closed before returning, on every path.
    /// If the returned future is dropped early, pumps are aborted and the
    /// transport is released by dropping the session and connection.
    ///
    /// # Errors
    /// - `ExecError::ConfigError` if address or credentials are missing (no I/O happens)
    /// - dial, session and pipe errors from the transport, returned unchanged
    /// - the remote execution error and any stream pump failures, collected
    ///   into one outcome once the command has finished
    /// - `ExecError::Timeout` if a configured deadline expires
    #[instrument(skip(self), fields(address = %self.config.address, port = self.config.port))]
    pub async fn execute(&mut self, command: &str) -> Result<(), ExecError> {
        let credentials = self.config.validate()?;

        info!(user = %credentials.user, "connecting");
        let mut connection = self
            .transport
            .dial(&self.config.address, self.config.port, credentials)
            .await?;

        let result = self.execute_on(&mut connection, command).await;

        if let Err(e) = connection.close().await {
            warn!(error = %e, "failed to close connection");
        }
        result
    }

    async fn execute_on(
        &mut self,
        connection: &mut T::Connection,
        command: &str,
    ) -> Result<(), ExecError> {
        let mut session = connection.new_session().await?;
        debug!("session opened");

        let result = self.run_session(&mut session, command).await;

        if let Err(e) = session.close().await {
            warn!(error = %e, "failed to close session");
        }
        result
    }

    async fn run_session<S: Session>(
        &mut self,
        session: &mut S,
        command: &str,
    ) -> Result<(), ExecError> {
        let mut pumps = self.start_pumps(session)?;

        let run_and_collect = async {
            let mut errors = StreamErrors::new();

            debug!(command = %command, pumps = pumps.len(), "running remote command");
            if let Err(e) = session.run(command).await {
                warn!(error = %e, "remote command failed");
                errors.push(e);
            }

            // pumps were started in stdout, stderr, stdin order
            for pump in &mut pumps {
                let failures = pump.drain().await;
                debug!(stream = %pump.stream(), failures = failures.len(), "pump drained");
                errors.extend(failures);
            }
            if !errors.is_empty() {
                debug!(failures = errors.len(), "command finished with errors");
            }
            errors.into_result()
        };

        let Some(deadline) = self.config.timeout else {
            return run_and_collect.await;
        };

        let outcome = timeout(deadline, run_and_collect).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                // pumps are aborted when dropped on return
                warn!(timeout = ?deadline, "command timed out, aborting stream pumps");
                Err(ExecError::Timeout { timeout: deadline })
            }
        }
    }

    /// Acquire a pipe and start a pump for every wired stream
    ///
    /// Stops at the first pipe that cannot be opened; pumps already started
    /// are aborted as they are dropped.
    fn start_pumps<S: Session>(&mut self, session: &mut S) -> Result<Vec<Pump>, ExecError> {
        let mut pumps = Vec::with_capacity(3);

        if let Err(e) = self.open_pipes(session, &mut pumps) {
            warn!(error = %e, "failed to open stream pipe");
            return Err(e);
        }
        Ok(pumps)
    }

    fn open_pipes<S: Session>(
        &mut self,
        session: &mut S,
        pumps: &mut Vec<Pump>,
    ) -> Result<(), ExecError> {
        if let Some(tx) = self.stdout.take() {
            let pipe = session.stdout_pipe()?;
            pumps.push(pump::spawn_output(StreamKind::Stdout, pipe, tx));
        }
        if let Some(tx) = self.stderr.take() {
            let pipe = session.stderr_pipe()?;
            pumps.push(pump::spawn_output(StreamKind::Stderr, pipe, tx));
        }
        if let Some(rx) = self.stdin.take() {
            let pipe = session.stdin_pipe()?;
            pumps.push(pump::spawn_input(rx, pipe));
        }
        Ok(())
    }
}
