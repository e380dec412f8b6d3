//! Configuration loading and types

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{WrapErr, eyre};
use serde::{Deserialize, Serialize};
use sshstream_exec::{Credentials, ExecutorConfig, KeySource};

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Remote host settings
    #[serde(default)]
    pub target: TargetConfig,
}

/// Remote host and authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// IP address or hostname for SSH connection
    #[serde(default)]
    pub address: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// SSH user (defaults to root)
    #[serde(default = "default_user")]
    pub user: String,
    /// Path to SSH private key
    pub key_path: Option<String>,
    /// Environment variable holding a base64-encoded private key
    pub key_env: Option<String>,
    /// Environment variable holding a password
    pub password_env: Option<String>,
    /// Pinned host key fingerprint (`SHA256:...`)
    pub fingerprint: Option<String>,
    /// Deadline for the whole command, in seconds
    pub timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            target: TargetConfig::default(),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: default_port(),
            user: default_user(),
            key_path: None,
            key_env: None,
            password_env: None,
            fingerprint: None,
            timeout_secs: None,
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_port() -> u16 {
    sshstream_exec::config::DEFAULT_PORT
}

fn default_user() -> String {
    "root".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).wrap_err_with(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be loaded
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var("SSHSTREAM_CONFIG") {
            return Self::load(&PathBuf::from(path));
        }

        let paths = [
            Some(PathBuf::from("sshstream.toml")),
            dirs::config_dir().map(|p| p.join("sshstream/sshstream.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        Ok(Config::default())
    }
}

impl TargetConfig {
    /// Credentials selected from the configured sources
    ///
    /// Password beats an environment key, which beats a key file. Returns
    /// `None` when nothing is configured.
    ///
    /// # Errors
    /// Returns error if the password variable is named but unset
    pub fn credentials(&self) -> eyre::Result<Option<Credentials>> {
        if let Some(var) = &self.password_env {
            let password =
                std::env::var(var).map_err(|_| eyre!("environment variable {var} not set"))?;
            return Ok(Some(Credentials::with_password(&self.user, password)));
        }
        if let Some(var) = &self.key_env {
            return Ok(Some(Credentials::with_key(
                &self.user,
                KeySource::Env(var.clone()),
            )));
        }
        Ok(self
            .key_path
            .as_deref()
            .map(|path| Credentials::with_key(&self.user, KeySource::path(expand_home(path)))))
    }

    /// Build the executor configuration
    ///
    /// # Errors
    /// Returns error if credentials cannot be assembled
    pub fn executor_config(&self) -> eyre::Result<ExecutorConfig> {
        Ok(ExecutorConfig {
            address: self.address.clone(),
            port: self.port,
            credentials: self.credentials()?,
            timeout: self.timeout_secs.map(Duration::from_secs),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
