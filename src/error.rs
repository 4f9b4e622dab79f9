//! Error types for winrm-exec.
//!
//! Every failure in the pipeline maps onto one [`WinRmError`] variant. The
//! display string of each variant starts with its taxonomy name
//! (`ConfigError`, `ExecutionTimeout`, ...) so the top-level JSON report can be
//! matched on by callers without parsing anything else.

use thiserror::Error;

/// Result type alias for WinRM operations.
pub type WinRmResult<T> = std::result::Result<T, WinRmError>;

/// Boxed error used to preserve an underlying cause.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// WS-Management fault code the server returns when a Receive's
/// `OperationTimeout` expires before the command produced output.
pub const WSMAN_OPERATION_TIMEOUT: u32 = 2_150_858_793;

/// Classification of transport-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The request did not complete within the per-request timeout.
    Timeout,
    /// Connection refused, DNS failure, TLS handshake failure.
    Connect,
    /// The server answered with an unexpected HTTP status.
    Status(u16),
    /// Anything else (body read failures, malformed framing).
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::Timeout => write!(f, "timeout"),
            TransportErrorKind::Connect => write!(f, "connect"),
            TransportErrorKind::Status(code) => write!(f, "http {}", code),
            TransportErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Errors raised while resolving, authenticating or executing against a WinRM endpoint.
#[derive(Error, Debug)]
pub enum WinRmError {
    /// Bad endpoint, port, scheme or configuration file.
    #[error("ConfigError: {0}")]
    Config(String),

    /// An authentication method that sends credentials in the clear was
    /// requested over plain HTTP.
    #[error("InsecureAuthError: {0}")]
    InsecureAuth(String),

    /// The handshake failed or the server rejected the credentials.
    #[error("AuthenticationError: {message}")]
    Authentication {
        /// Human-readable description
        message: String,
        /// Underlying cause, usually a transport error
        #[source]
        source: Option<BoxError>,
    },

    /// Connection refused, DNS, TLS or HTTP-level failure.
    #[error("TransportError: {message}")]
    Transport {
        /// What kind of transport failure occurred
        kind: TransportErrorKind,
        /// Human-readable description
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// The server answered with a SOAP fault.
    #[error("SoapFault: {reason} [{code}]")]
    SoapFault {
        /// Fault subcode if present, otherwise the fault code
        code: String,
        /// WS-Management numeric fault code (`WSManFault/@Code`)
        wsman_code: Option<u32>,
        /// Fault reason or WSManFault message
        reason: String,
    },

    /// The remote shell could not be created.
    #[error("ShellCreationFailed: {0}")]
    ShellCreationFailed(#[source] Box<WinRmError>),

    /// The command could not be started inside an open shell.
    #[error("CommandDispatchFailed: {0}")]
    CommandDispatchFailed(#[source] Box<WinRmError>),

    /// The invocation deadline elapsed, or Receive kept timing out.
    #[error("ExecutionTimeout: {0}")]
    ExecutionTimeout(String),

    /// The invocation was cancelled by the caller.
    #[error("Cancelled: invocation cancelled before the remote command completed")]
    Cancelled,

    /// Catch-all for malformed responses and internal inconsistencies.
    #[error("UnexpectedError: {0}")]
    Unexpected(String),
}

impl WinRmError {
    /// Create an authentication error without an underlying cause.
    pub fn authentication(message: impl Into<String>) -> Self {
        WinRmError::Authentication {
            message: message.into(),
            source: None,
        }
    }

    /// Create an authentication error that preserves `source`. The cause is
    /// also appended to the message so the report names it.
    pub fn authentication_with(
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        let source = source.into();
        WinRmError::Authentication {
            message: format!("{}: {}", message.into(), source),
            source: Some(source),
        }
    }

    /// Create a transport error without an underlying cause.
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        WinRmError::Transport {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Whether this is a per-request transport timeout.
    pub fn is_transport_timeout(&self) -> bool {
        matches!(
            self,
            WinRmError::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            }
        )
    }

    /// Whether this is the server-side "no output yet" Receive fault.
    pub fn is_operation_timeout(&self) -> bool {
        match self {
            WinRmError::SoapFault {
                code, wsman_code, ..
            } => {
                *wsman_code == Some(WSMAN_OPERATION_TIMEOUT)
                    || code.rsplit(':').next() == Some("TimedOut")
            }
            _ => false,
        }
    }

    /// Whether the error is reported as-is rather than wrapped in the stage
    /// that hit it. The handshake runs on the first exchange, inside CreateShell.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self,
            WinRmError::ExecutionTimeout(_)
                | WinRmError::Cancelled
                | WinRmError::Authentication { .. }
        )
    }
}

impl From<reqwest::Error> for WinRmError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if let Some(status) = err.status() {
            TransportErrorKind::Status(status.as_u16())
        } else {
            TransportErrorKind::Other
        };

        // reqwest's display stops at "error sending request"; name the cause too
        let mut message = err.to_string();
        let mut cause = std::error::Error::source(&err);
        while let Some(inner) = cause {
            let text = inner.to_string();
            if !message.contains(&text) {
                message.push_str(": ");
                message.push_str(&text);
            }
            cause = std::error::Error::source(inner);
        }

        WinRmError::Transport {
            kind,
            message,
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_display_carries_taxonomy_name() {
        assert!(WinRmError::Config("bad port".into())
            .to_string()
            .starts_with("ConfigError:"));
        assert!(WinRmError::ExecutionTimeout("deadline".into())
            .to_string()
            .starts_with("ExecutionTimeout:"));
        assert!(WinRmError::Cancelled.to_string().starts_with("Cancelled:"));
    }

    #[test]
    fn test_wrapped_errors_keep_source() {
        let inner = WinRmError::transport(TransportErrorKind::Connect, "connection refused");
        let err = WinRmError::ShellCreationFailed(Box::new(inner));

        assert_eq!(
            err.to_string(),
            "ShellCreationFailed: TransportError: connection refused"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn test_authentication_preserves_cause() {
        let cause = WinRmError::transport(TransportErrorKind::Timeout, "timed out");
        let err = WinRmError::authentication_with("NTLM negotiate failed", cause);

        let source = err.source().expect("source");
        assert!(source.to_string().contains("timed out"));
        assert_eq!(
            err.to_string(),
            "AuthenticationError: NTLM negotiate failed: TransportError: timed out"
        );
    }

    #[test]
    fn test_operation_timeout_detection() {
        let fault = WinRmError::SoapFault {
            code: "w:TimedOut".into(),
            wsman_code: None,
            reason: "The WS-Management service cannot complete the operation".into(),
        };
        assert!(fault.is_operation_timeout());

        let by_code = WinRmError::SoapFault {
            code: "s:Receiver".into(),
            wsman_code: Some(WSMAN_OPERATION_TIMEOUT),
            reason: String::new(),
        };
        assert!(by_code.is_operation_timeout());

        let other = WinRmError::SoapFault {
            code: "w:AccessDenied".into(),
            wsman_code: Some(5),
            reason: "Access is denied.".into(),
        };
        assert!(!other.is_operation_timeout());
    }

    #[test]
    fn test_transport_timeout_detection() {
        assert!(WinRmError::transport(TransportErrorKind::Timeout, "slow").is_transport_timeout());
        assert!(!WinRmError::transport(TransportErrorKind::Connect, "refused").is_transport_timeout());
    }
}
