//! SSH credentials and key resolution

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use russh::keys::{PrivateKey, decode_secret_key, load_secret_key};
use tracing::debug;

use crate::error::ExecError;

/// User name plus the method used to authenticate it
#[derive(Clone)]
pub struct Credentials {
    /// Remote user name
    pub user: String,
    /// How to authenticate
    pub auth: Auth,
}

impl Credentials {
    /// Authenticate with a private key
    pub fn with_key(user: impl Into<String>, source: KeySource) -> Self {
        Self {
            user: user.into(),
            auth: Auth::Key(source),
        }
    }

    /// Authenticate with a password
    pub fn with_password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            auth: Auth::Password(password.into()),
        }
    }

    /// Load key material so it can be handed to the SSH client
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if the key cannot be located or decoded
    pub fn resolve(&self) -> Result<ResolvedAuth, ExecError> {
        match &self.auth {
            Auth::Password(password) => Ok(ResolvedAuth::Password(password.clone())),
            Auth::Key(source) => source.load().map(ResolvedAuth::Key),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("auth", &self.auth)
            .finish()
    }
}

/// Authentication method
#[derive(Clone)]
pub enum Auth {
    /// Public key authentication
    Key(KeySource),
    /// Password authentication
    Password(String),
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::Key(source) => f.debug_tuple("Key").field(source).finish(),
            Auth::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Where to read a private key from
#[derive(Clone)]
pub enum KeySource {
    /// Key file on disk, with an optional passphrase
    Path {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Base64-encoded key stored in an environment variable
    Env(String),
}

impl KeySource {
    /// Unencrypted key file
    pub fn path(path: impl Into<PathBuf>) -> Self {
        KeySource::Path {
            path: path.into(),
            passphrase: None,
        }
    }

    fn load(&self) -> Result<PrivateKey, ExecError> {
        match self {
            KeySource::Path { path, passphrase } => {
                validate_key_permissions(path)?;
                debug!(path = %path.display(), "loading SSH key");
                load_secret_key(path, passphrase.as_deref())
                    .map_err(|e| ExecError::SshKeyError(format!("{}: {e}", path.display())))
            }
            KeySource::Env(var_name) => {
                let encoded = env::var(var_name).map_err(|_| {
                    ExecError::SshKeyError(format!("environment variable {var_name} not set"))
                })?;
                let pem = base64_decode(&encoded)?;
                debug!(var = %var_name, "decoding SSH key from environment");
                decode_secret_key(&pem, None).map_err(|e| ExecError::SshKeyError(e.to_string()))
            }
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Path { path, passphrase } => f
                .debug_struct("Path")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            KeySource::Env(var) => f.debug_tuple("Env").field(var).finish(),
        }
    }
}

/// Key material ready for authentication
pub enum ResolvedAuth {
    Key(PrivateKey),
    Password(String),
}

fn base64_decode(input: &str) -> Result<String, ExecError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(input.trim())
        .map_err(|_| ExecError::SshKeyError("invalid base64 encoding".to_string()))?;
    String::from_utf8(bytes)
        .map_err(|_| ExecError::SshKeyError("decoded key is not valid UTF-8".to_string()))
}

#[cfg(unix)]
fn validate_key_permissions(path: &Path) -> Result<(), ExecError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)
        .map_err(|e| ExecError::SshKeyError(format!("{}: {e}", path.display())))?;

    // group and other bits must be clear
    if metadata.permissions().mode() & 0o77 != 0 {
        return Err(ExecError::SshKeyError(format!(
            "key file permissions too open: {} (should be 600)",
            path.display()
        )));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_key_permissions(path: &Path) -> Result<(), ExecError> {
    if path.exists() {
        Ok(())
    } else {
        Err(ExecError::SshKeyError(format!(
            "key file not found: {}",
            path.display()
        )))
    }
}
