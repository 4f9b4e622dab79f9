//! WinRM connection layer.
//!
//! Executes a single command on a Windows host over WS-Management.
//!
//! # Overview
//!
//! An invocation flows through these pieces:
//!
//! - [`endpoint`]: resolves `host`/`port`/`scheme` into `scheme://host:port/wsman`
//! - [`auth`]: picks an authentication strategy (NTLM, Kerberos, CredSSP, Basic)
//! - [`transport`]: the authenticated HTTP session, with optional message sealing
//! - [`soap`]: builds the CreateShell, Command, Receive, Signal and DeleteShell envelopes
//! - [`decoder`]: parses responses and SOAP faults
//! - [`executor`]: the shell lifecycle state machine, including cleanup
//! - [`session`]: ties the above together behind [`WinRmSession`]
//!
//! # Example
//!
//! ```rust,ignore
//! use winrm_exec::connection::{ConnectionConfig, Credentials, WinRmSession};
//!
//! let config = ConnectionConfig::new("192.168.1.100").with_https(true);
//! let session = WinRmSession::new(config, Credentials::new("CORP\\admin", "secret"));
//!
//! let result = session.run_ps("Get-Service winrm").await?;
//! println!("{} (exit {})", result.stdout, result.exit_code);
//! ```

pub mod auth;
pub mod config;
pub mod decoder;
pub mod endpoint;
pub mod executor;
pub mod retry;
pub mod session;
pub mod soap;
pub mod transport;

pub use auth::{AuthFactory, AuthMethod, Credentials, SecurityContext, SecurityContextProvider};
pub use config::{CertValidation, ConnectionConfig, MessageEncryption};
pub use endpoint::{Endpoint, Scheme};
pub use executor::{CommandExecutor, ExecutionResult, ExecutorOptions, ExecutorState};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use session::WinRmSession;
pub use soap::{CommandLine, ShellOptions};
pub use transport::{HttpTransport, Transport};
