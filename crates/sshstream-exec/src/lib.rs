//! sshstream-exec: remote command execution with live streams
//!
//! Runs one command per call over SSH and exposes its stdout, stderr and
//! stdin as line-oriented tokio channels. Stream pump failures are
//! collected and reported together with the remote exit status.

pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod pump;
pub mod ssh;
pub mod transport;

pub use config::ExecutorConfig;
pub use credentials::{Auth, Credentials, KeySource};
pub use error::{ExecError, StreamErrors, StreamKind};
pub use executor::CommandExecutor;
pub use ssh::SshTransport;
