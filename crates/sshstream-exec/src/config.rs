//! Executor configuration

use std::time::Duration;

use crate::credentials::Credentials;
use crate::error::ExecError;

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Target and credentials for one command execution
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Host name or IP address of the remote machine
    pub address: String,
    /// SSH port (defaults to 22)
    pub port: u16,
    /// Credentials used to authenticate
    pub credentials: Option<Credentials>,
    /// Deadline for running the command and draining its streams.
    ///
    /// `None` waits indefinitely: a remote side that never closes its
    /// pipes will then block `execute` forever.
    pub timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: DEFAULT_PORT,
            credentials: None,
            timeout: None,
        }
    }
}

impl ExecutorConfig {
    /// Create config for `address` on the default port
    pub fn new(address: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            address: address.into(),
            port: DEFAULT_PORT,
            credentials: Some(credentials),
            timeout: None,
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Bound the run-and-drain phase
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Check that an address and credentials are present
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` naming the missing field
    pub fn validate(&self) -> Result<&Credentials, ExecError> {
        if self.address.trim().is_empty() {
            return Err(ExecError::ConfigError(
                "cannot execute command without a server address".to_string(),
            ));
        }
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            ExecError::ConfigError("cannot execute command without credentials".to_string())
        })?;
        if self.port == 0 {
            return Err(ExecError::ConfigError("port must be non-zero".to_string()));
        }
        Ok(credentials)
    }
}
