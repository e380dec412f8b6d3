//! Transport abstraction used by the command executor
//!
//! The executor only talks to these traits. `ssh::SshTransport` is the
//! production implementation; tests plug in scripted fakes.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::credentials::Credentials;
use crate::error::ExecError;

/// Readable end of a remote output stream
pub type PipeReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable end of the remote input stream
pub type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Dials authenticated connections
#[async_trait]
pub trait Transport: Send + Sync {
    type Connection: Connection;

    /// Connect and authenticate to `address:port`
    async fn dial(
        &self,
        address: &str,
        port: u16,
        credentials: &Credentials,
    ) -> Result<Self::Connection, ExecError>;
}

/// An established connection able to open command sessions
///
/// Dropping a connection without calling `close` must still release it;
/// this happens when a caller cancels `CommandExecutor::execute`.
#[async_trait]
pub trait Connection: Send {
    type Session: Session;

    /// Open a new command session
    async fn new_session(&mut self) -> Result<Self::Session, ExecError>;

    /// Close the connection. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), ExecError>;
}

/// A session that runs exactly one command
///
/// Like [`Connection`], a session must release its resources on drop.
#[async_trait]
pub trait Session: Send {
    /// Pipe carrying the command's standard output
    fn stdout_pipe(&mut self) -> Result<PipeReader, ExecError>;

    /// Pipe carrying the command's standard error
    fn stderr_pipe(&mut self) -> Result<PipeReader, ExecError>;

    /// Pipe feeding the command's standard input
    fn stdin_pipe(&mut self) -> Result<PipeWriter, ExecError>;

    /// Run `command` and wait for it to exit
    ///
    /// Returns an error on non-zero exit status or transport failure.
    async fn run(&mut self, command: &str) -> Result<(), ExecError>;

    /// Close the session. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), ExecError>;
}
