//! Error types for sshstream-exec

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Which standard stream of the remote process a pump is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
    Stdin,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
            StreamKind::Stdin => "stdin",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while executing a remote command
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Executor is missing an address or credentials
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Failed to open a session on an established connection
    #[error("session failed: {0}")]
    SessionFailed(String),

    /// Failed to acquire a stream pipe from the session
    #[error("failed to open {stream} pipe: {message}")]
    PipeFailed {
        /// Stream the pipe was requested for
        stream: StreamKind,
        /// Underlying cause
        message: String,
    },

    /// Remote command exited with a non-zero status
    #[error("remote command exited with status {status}")]
    CommandFailed {
        /// Exit status code
        status: u32,
    },

    /// Remote command was terminated by a signal
    #[error("remote command killed by signal {signal}")]
    Signaled {
        /// Signal name as reported by the server
        signal: String,
    },

    /// Transport fault while the command was running
    #[error("transport error: {0}")]
    Transport(String),

    /// A single stream pump failed
    #[error("{stream}: {message}")]
    Stream {
        /// Stream the pump was bound to
        stream: StreamKind,
        /// Underlying cause
        message: String,
    },

    /// Aggregated failures collected after the command finished
    #[error(transparent)]
    Streams(StreamErrors),

    /// Command timed out
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },
}

impl ExecError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_) | ExecError::Timeout { .. }
        )
    }

    /// Build a stream error from an I/O failure
    pub(crate) fn stream(stream: StreamKind, err: impl fmt::Display) -> Self {
        ExecError::Stream {
            stream,
            message: err.to_string(),
        }
    }

    /// Build a pipe acquisition error
    pub(crate) fn pipe(stream: StreamKind, err: impl fmt::Display) -> Self {
        ExecError::PipeFailed {
            stream,
            message: err.to_string(),
        }
    }
}

/// Ordered list of failures found once a command has finished.
///
/// The remote execution error (if any) comes first, then stdout, stderr
/// and stdin pump failures, in that order.
#[derive(Debug, Clone, Default)]
pub struct StreamErrors {
    errors: Vec<ExecError>,
}

impl StreamErrors {
    /// Create an empty collection
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one failure
    pub fn push(&mut self, err: ExecError) {
        self.errors.push(err);
    }

    /// Append every failure from another collection
    pub fn extend(&mut self, other: impl IntoIterator<Item = ExecError>) {
        self.errors.extend(other);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Collected failures in report order
    #[must_use]
    pub fn errors(&self) -> &[ExecError] {
        &self.errors
    }

    /// Failures reported by the pump bound to `stream`
    pub fn for_stream(&self, stream: StreamKind) -> impl Iterator<Item = &ExecError> {
        self.errors
            .iter()
            .filter(move |e| matches!(e, ExecError::Stream { stream: s, .. } if *s == stream))
    }

    /// Collapse into the single outcome returned to the caller
    ///
    /// Empty yields `Ok`, a lone failure is returned as is, anything else is
    /// wrapped in `ExecError::Streams`.
    ///
    /// # Errors
    /// Returns the collected failures when there is at least one
    pub fn into_result(mut self) -> Result<(), ExecError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(ExecError::Streams(self)),
        }
    }
}

impl fmt::Display for StreamErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("errors found processing command streams:")?;
        for err in &self.errors {
            write!(f, "\n  {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for StreamErrors {}

impl IntoIterator for StreamErrors {
    type Item = ExecError;
    type IntoIter = std::vec::IntoIter<ExecError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_ok() {
        assert!(StreamErrors::new().into_result().is_ok());
    }

    #[test]
    fn test_single_error_unwrapped() {
        let mut errors = StreamErrors::new();
        errors.push(ExecError::CommandFailed { status: 2 });

        let err = errors.into_result().unwrap_err();
        assert!(matches!(err, ExecError::CommandFailed { status: 2 }));
    }

    #[test]
    fn test_display_keeps_order() {
        let mut errors = StreamErrors::new();
        errors.push(ExecError::stream(StreamKind::Stdout, "E1"));
        errors.push(ExecError::stream(StreamKind::Stdin, "E2"));

        let text = errors.into_result().unwrap_err().to_string();
        let first = text.find("stdout: E1").unwrap();
        let second = text.find("stdin: E2").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_for_stream_filters() {
        let mut errors = StreamErrors::new();
        errors.push(ExecError::CommandFailed { status: 1 });
        errors.push(ExecError::stream(StreamKind::Stderr, "broken"));

        assert_eq!(errors.for_stream(StreamKind::Stderr).count(), 1);
        assert_eq!(errors.for_stream(StreamKind::Stdout).count(), 0);
    }

    #[test]
    fn test_retryable() {
        assert!(ExecError::ConnectionFailed("refused".into()).is_retryable());
        assert!(!ExecError::CommandFailed { status: 1 }.is_retryable());
    }
}
