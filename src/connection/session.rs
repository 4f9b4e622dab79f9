//! WinRM session.
//!
//! Ties the pieces together for one invocation: validates the configuration,
//! resolves the endpoint, selects the auth strategy, builds the transport and
//! runs the command executor.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

use super::auth::{AuthFactory, Credentials, SecurityContextProvider};
use super::config::{CertValidation, ConnectionConfig};
use super::executor::{CommandExecutor, ExecutionResult, ExecutorOptions};
use super::soap::{CommandLine, ShellOptions};
use super::transport::HttpTransport;
use crate::error::WinRmResult;

/// A configured, not yet connected, WinRM session.
///
/// Each `run_*` call opens its own transport and shell, so independent calls
/// share no state.
pub struct WinRmSession {
    config: ConnectionConfig,
    credentials: Credentials,
    shell: ShellOptions,
    executor: ExecutorOptions,
    provider: Option<Arc<dyn SecurityContextProvider>>,
    cancel: CancellationToken,
}

impl WinRmSession {
    /// Create a session with default shell and executor options.
    pub fn new(config: ConnectionConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials,
            shell: ShellOptions::default(),
            executor: ExecutorOptions::default(),
            provider: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set shell options
    pub fn with_shell_options(mut self, shell: ShellOptions) -> Self {
        self.shell = shell;
        self
    }

    /// Set executor options
    pub fn with_executor_options(mut self, executor: ExecutorOptions) -> Self {
        self.executor = executor;
        self
    }

    /// Supply Kerberos / CredSSP security contexts
    pub fn with_security_provider(mut self, provider: Arc<dyn SecurityContextProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Cancel in-flight commands when `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Run a PowerShell script.
    pub async fn run_ps(&self, script: &str) -> WinRmResult<ExecutionResult> {
        self.run(&CommandLine::powershell(script)).await
    }

    /// Run a cmd.exe command.
    pub async fn run_cmd(&self, command: &str, args: &[&str]) -> WinRmResult<ExecutionResult> {
        self.run(&CommandLine::cmd(command, args.iter().copied())).await
    }

    /// Run `command` in a fresh shell.
    pub async fn run(&self, command: &CommandLine) -> WinRmResult<ExecutionResult> {
        self.config.validate_timeouts(self.shell.operation_timeout)?;
        let endpoint = self.config.endpoint()?;

        let auth = AuthFactory::new(
            self.config.auth_method,
            self.credentials.clone(),
            endpoint.clone(),
        )
        .with_provider(self.provider.clone());
        let transport = HttpTransport::new(&self.config, auth)?;

        if endpoint.is_tls() && self.config.cert_validation == CertValidation::Ignore {
            warn!(
                endpoint = %endpoint,
                "server certificate validation is disabled"
            );
        }

        let span = info_span!(
            "winrm_command",
            endpoint = %endpoint,
            auth = %self.config.auth_method,
        );

        let mut executor = CommandExecutor::new(transport, self.shell.clone(), self.executor.clone())
            .with_cancellation(self.cancel.clone());

        executor.run(command).instrument(span).await
    }
}

impl std::fmt::Debug for WinRmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinRmSession")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .field("shell", &self.shell)
            .field("has_provider", &self.provider.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::auth::AuthMethod;
    use crate::error::WinRmError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_basic_over_http_fails_before_network() {
        let config = ConnectionConfig::new("192.0.2.1").with_auth_method(AuthMethod::Basic);
        let session = WinRmSession::new(config, Credentials::new("user", "pass"));

        let err = session.run_ps("hostname").await.unwrap_err();
        assert!(matches!(err, WinRmError::InsecureAuth(_)));
    }

    #[tokio::test]
    async fn test_timeouts_are_validated_first() {
        let config = ConnectionConfig::new("winhost").with_request_timeout(Duration::from_secs(10));
        let session = WinRmSession::new(config, Credentials::new("user", "pass"));

        let err = session.run_ps("hostname").await.unwrap_err();
        assert!(matches!(err, WinRmError::Config(_)));
    }

    #[test]
    fn test_debug_hides_password() {
        let session = WinRmSession::new(
            ConnectionConfig::new("winhost"),
            Credentials::new("user", "topsecret"),
        );
        assert!(!format!("{:?}", session).contains("topsecret"));
    }
}
