//! HTTP Basic authentication.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use secrecy::{ExposeSecret, SecretString};

use super::{AuthMethod, AuthStep, AuthStrategy, Credentials};
use crate::connection::endpoint::Endpoint;
use crate::error::{WinRmError, WinRmResult};

/// Basic authentication: a static `Authorization` header on every request.
pub struct BasicAuth {
    header: SecretString,
}

impl BasicAuth {
    /// Precompute the header value for `credentials`.
    pub fn new(credentials: &Credentials) -> Self {
        let raw = format!(
            "{}:{}",
            credentials.username(),
            credentials.password().expose_secret()
        );
        let header = format!("Basic {}", BASE64.encode(raw.as_bytes()));
        Self {
            header: SecretString::new(header.into_boxed_str()),
        }
    }
}

impl AuthStrategy for BasicAuth {
    fn method(&self) -> AuthMethod {
        AuthMethod::Basic
    }

    fn check_endpoint(&self, endpoint: &Endpoint) -> WinRmResult<()> {
        if endpoint.is_tls() {
            Ok(())
        } else {
            Err(WinRmError::InsecureAuth(format!(
                "basic authentication sends credentials in clear text and is refused over {}; use --use-https",
                endpoint.scheme()
            )))
        }
    }

    fn header_scheme(&self) -> &'static str {
        "Basic"
    }

    fn step(&mut self, _server_token: Option<&[u8]>) -> WinRmResult<AuthStep> {
        Ok(AuthStep::Complete)
    }

    fn is_established(&self) -> bool {
        true
    }

    fn authorization(&self) -> Option<String> {
        Some(self.header.expose_secret().to_string())
    }
}
