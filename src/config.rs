//! Configuration file support for winrm-exec
//!
//! An optional TOML file supplies client defaults:
//!
//! ```toml
//! [client]
//! operation_timeout = "20s"
//! request_timeout = "30s"
//! deadline = "10m"
//! cleanup_timeout = "5s"
//! codepage = 65001
//!
//! [client.receive_retry]
//! max_retries = 3
//! initial_delay = "500ms"
//! ```
//!
//! Command-line flags override file values; missing keys take built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::config::DEFAULT_REQUEST_TIMEOUT;
use crate::connection::executor::{ExecutorOptions, DEFAULT_CLEANUP_TIMEOUT, DEFAULT_DEADLINE};
use crate::connection::retry::RetryPolicy;
use crate::connection::soap::{
    ShellOptions, DEFAULT_CODEPAGE, DEFAULT_LOCALE, DEFAULT_MAX_ENVELOPE_SIZE,
    DEFAULT_OPERATION_TIMEOUT,
};
use crate::error::{WinRmError, WinRmResult};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Client defaults
    pub client: ClientSettings,
}

/// `[client]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    /// Server-side wait bound for each request
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Client-side timeout for a single HTTP exchange
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Overall bound on one invocation
    #[serde(with = "humantime_serde")]
    pub deadline: Duration,

    /// Budget for closing the shell
    #[serde(with = "humantime_serde")]
    pub cleanup_timeout: Duration,

    /// Receive retry policy
    pub receive_retry: RetryPolicy,

    /// Console code page
    pub codepage: u32,

    /// Maximum SOAP envelope size in bytes
    pub max_envelope_size: u32,

    /// Message and data locale
    pub locale: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT),
            deadline: DEFAULT_DEADLINE,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
            receive_retry: RetryPolicy::default(),
            codepage: DEFAULT_CODEPAGE,
            max_envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
            locale: DEFAULT_LOCALE.to_string(),
        }
    }
}

impl ClientSettings {
    /// Shell options derived from these settings.
    pub fn shell_options(&self) -> ShellOptions {
        ShellOptions {
            codepage: self.codepage,
            operation_timeout: self.operation_timeout,
            max_envelope_size: self.max_envelope_size,
            locale: self.locale.clone(),
            ..ShellOptions::default()
        }
    }

    /// Executor options derived from these settings.
    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions::default()
            .with_deadline(self.deadline)
            .with_cleanup_timeout(self.cleanup_timeout)
            .with_receive_retry(self.receive_retry.clone())
    }
}

impl Config {
    /// Load configuration from `config_path`, or defaults when none is given.
    pub fn load(config_path: Option<&PathBuf>) -> WinRmResult<Self> {
        match config_path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Load from a specific file
    pub fn from_file(path: impl AsRef<Path>) -> WinRmResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WinRmError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            WinRmError::Config(message) => {
                WinRmError::Config(format!("{}: {}", path.display(), message))
            }
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> WinRmResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| WinRmError::Config(e.to_string()))?;
        config.client.receive_retry.validate()?;
        Ok(config)
    }
}
