//! Connection configuration
//!
//! Immutable description of the target listener: host, port, scheme, the
//! authentication method, TLS validation policy, message encryption policy
//! and the per-request timeout.

use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::auth::AuthMethod;
use super::endpoint::{Endpoint, Scheme};
use crate::error::{WinRmError, WinRmResult};

/// Default per-request timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 30;

/// Server certificate validation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CertValidation {
    /// Standard chain and hostname checks
    Validate,
    /// Accept any certificate (self-signed lab hosts)
    #[default]
    Ignore,
}

/// Policy for wrapping SOAP bodies in NTLM/Kerberos/CredSSP session encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MessageEncryption {
    /// Encrypt over HTTP when the auth method can seal, never over HTTPS
    #[default]
    Auto,
    /// Always encrypt; fails if the auth method cannot seal
    Always,
    /// Never encrypt (requires `AllowUnencrypted` on plain HTTP listeners)
    Never,
}

/// WinRM connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Target hostname or IP address
    pub host: String,
    /// Explicit port; `None` picks 5985 or 5986 from the scheme
    pub port: Option<u32>,
    /// Listener scheme
    pub scheme: Scheme,
    /// Authentication method
    pub auth_method: AuthMethod,
    /// TLS certificate validation policy
    pub cert_validation: CertValidation,
    /// Message encryption policy
    pub message_encryption: MessageEncryption,
    /// Timeout for a single HTTP exchange
    pub request_timeout: Duration,
}

impl ConnectionConfig {
    /// Create a config for `host` with defaults (NTLM over HTTP on 5985).
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            scheme: Scheme::Http,
            auth_method: AuthMethod::default(),
            cert_validation: CertValidation::default(),
            message_encryption: MessageEncryption::default(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Set the port
    pub fn with_port(mut self, port: u32) -> Self {
        self.port = Some(port);
        self
    }

    /// Switch between HTTP and HTTPS
    pub fn with_https(mut self, use_https: bool) -> Self {
        self.scheme = Scheme::from_use_https(use_https);
        self
    }

    /// Set the authentication method
    pub fn with_auth_method(mut self, method: AuthMethod) -> Self {
        self.auth_method = method;
        self
    }

    /// Set the certificate validation policy
    pub fn with_cert_validation(mut self, validation: CertValidation) -> Self {
        self.cert_validation = validation;
        self
    }

    /// Set the message encryption policy
    pub fn with_message_encryption(mut self, policy: MessageEncryption) -> Self {
        self.message_encryption = policy;
        self
    }

    /// Set the per-request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Port actually used: the explicit one or the scheme default.
    pub fn effective_port(&self) -> u32 {
        self.port
            .unwrap_or_else(|| u32::from(self.scheme.default_port()))
    }

    /// Resolve the endpoint URL.
    pub fn endpoint(&self) -> WinRmResult<Endpoint> {
        Endpoint::resolve(&self.host, self.effective_port(), self.scheme)
    }

    /// The request timeout must outlast the server-side Receive wait, or every
    /// idle poll would be cut off by the client.
    pub fn validate_timeouts(&self, operation_timeout: Duration) -> WinRmResult<()> {
        if operation_timeout.is_zero() {
            return Err(WinRmError::Config(
                "operation timeout must be greater than zero".to_string(),
            ));
        }
        if self.request_timeout <= operation_timeout {
            return Err(WinRmError::Config(format!(
                "request timeout ({:?}) must exceed the operation timeout ({:?})",
                self.request_timeout, operation_timeout
            )));
        }
        Ok(())
    }
}
