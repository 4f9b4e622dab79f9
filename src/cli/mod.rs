//! CLI module for winrm-exec
//!
//! Argument parsing and the glue from parsed arguments to a [`WinRmSession`].

pub mod json_output;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connection::auth::{AuthMethod, Credentials};
use crate::connection::config::{CertValidation, ConnectionConfig, MessageEncryption};
use crate::connection::executor::ExecutionResult;
use crate::connection::session::WinRmSession;
use crate::error::WinRmResult;

pub use json_output::ExecutionReport;

/// Run a single PowerShell command on a Windows host over WinRM
///
/// Prints one JSON line: {"success":bool,"stdout":str,"stderr":str,"exitCode":int}.
#[derive(Parser, Debug, Clone)]
#[command(name = "winrm-exec")]
#[command(author = "winrm-exec Contributors")]
#[command(version)]
#[command(about = "Run a PowerShell command on a Windows host over WinRM", long_about = None)]
pub struct Cli {
    /// Target hostname or IP address
    pub host: String,

    /// Username (user, DOMAIN\user or user@domain)
    pub username: String,

    /// Password
    pub password: String,

    /// PowerShell command to run
    pub command: String,

    /// Authentication transport
    #[arg(long, value_enum, default_value_t = AuthMethod::Ntlm)]
    pub transport: AuthMethod,

    /// Use HTTPS (port 5986 unless --port is given)
    #[arg(long)]
    pub use_https: bool,

    /// WinRM port
    #[arg(long)]
    pub port: Option<u32>,

    /// Server certificate validation
    #[arg(long, value_enum, default_value_t = CertValidation::Ignore)]
    pub server_cert_validation: CertValidation,

    /// Message-level encryption
    #[arg(long, value_enum, default_value_t = MessageEncryption::Auto)]
    pub message_encryption: MessageEncryption,

    /// Server-side wait bound for each request (e.g. "20s")
    #[arg(long, value_parser = parse_duration)]
    pub operation_timeout: Option<Duration>,

    /// Overall deadline for the invocation (e.g. "10m")
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Path to configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Verbosity level for logs on stderr (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

impl Cli {
    /// Get the effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
    }

    /// Build the connection config, layering flags over file settings.
    pub fn connection_config(&self, config: &Config) -> ConnectionConfig {
        let mut connection = ConnectionConfig::new(&self.host)
            .with_https(self.use_https)
            .with_auth_method(self.transport)
            .with_cert_validation(self.server_cert_validation)
            .with_message_encryption(self.message_encryption)
            .with_request_timeout(config.client.request_timeout);
        if let Some(port) = self.port {
            connection = connection.with_port(port);
        }
        connection
    }

    /// Build the session for this invocation.
    pub fn session(&self, config: &Config, cancel: CancellationToken) -> WinRmSession {
        let mut shell = config.client.shell_options();
        if let Some(timeout) = self.operation_timeout {
            shell = shell.with_operation_timeout(timeout);
        }

        let mut executor = config.client.executor_options();
        if let Some(deadline) = self.timeout {
            executor = executor.with_deadline(deadline);
        }

        WinRmSession::new(
            self.connection_config(config),
            Credentials::new(&self.username, &self.password),
        )
        .with_shell_options(shell)
        .with_executor_options(executor)
        .with_cancellation(cancel)
    }

    /// Load configuration and run the command.
    pub async fn run(&self, cancel: CancellationToken) -> WinRmResult<ExecutionResult> {
        let config = Config::load(self.config.as_ref())?;
        self.session(&config, cancel).run_ps(&self.command).await
    }

    /// Run the command and render the outcome as a report.
    pub async fn execute(&self, cancel: CancellationToken) -> ExecutionReport {
        ExecutionReport::from_outcome(self.run(cancel).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::endpoint::Scheme;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["winrm-exec"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["winhost", "admin", "secret", "hostname"]);
        assert_eq!(cli.transport, AuthMethod::Ntlm);
        assert_eq!(cli.server_cert_validation, CertValidation::Ignore);
        assert_eq!(cli.message_encryption, MessageEncryption::Auto);
        assert!(!cli.use_https);
        assert!(cli.port.is_none());

        let connection = cli.connection_config(&Config::default());
        assert_eq!(connection.effective_port(), 5985);
        assert_eq!(connection.scheme, Scheme::Http);
    }

    #[test]
    fn test_https_defaults_to_5986() {
        let cli = parse(&["winhost", "admin", "secret", "hostname", "--use-https"]);
        let connection = cli.connection_config(&Config::default());
        assert_eq!(connection.effective_port(), 5986);
        assert_eq!(connection.scheme, Scheme::Https);
    }

    #[test]
    fn test_explicit_flags() {
        let cli = parse(&[
            "winhost",
            "CORP\\admin",
            "secret",
            "Get-Date",
            "--transport",
            "basic",
            "--port",
            "8443",
            "--server-cert-validation",
            "validate",
            "--operation-timeout",
            "5s",
            "--timeout",
            "1m",
            "-vv",
        ]);
        assert_eq!(cli.transport, AuthMethod::Basic);
        assert_eq!(cli.port, Some(8443));
        assert_eq!(cli.server_cert_validation, CertValidation::Validate);
        assert_eq!(cli.operation_timeout, Some(Duration::from_secs(5)));
        assert_eq!(cli.timeout, Some(Duration::from_secs(60)));
        assert_eq!(cli.verbosity(), 2);
    }

    #[test]
    fn test_missing_positionals_rejected() {
        assert!(Cli::try_parse_from(["winrm-exec", "winhost"]).is_err());
    }

    #[test]
    fn test_unknown_transport_rejected() {
        assert!(Cli::try_parse_from([
            "winrm-exec", "h", "u", "p", "c", "--transport", "ssh"
        ])
        .is_err());
    }

    #[tokio::test]
    async fn test_out_of_range_port_reports_config_error() {
        let cli = parse(&["winhost", "admin", "secret", "hostname", "--port", "70000"]);
        let report = cli.execute(CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.exit_code, 1);
        assert!(report.stderr.starts_with("ConfigError"));
    }
}
