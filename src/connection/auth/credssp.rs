//! CredSSP authentication.
//!
//! CredSSP delegates the user's credentials to the server inside a TLS
//! channel, so it is refused on plain HTTP listeners. The TSRequest exchange
//! is supplied by an external [`SecurityContext`].

use super::{
    AuthMethod, AuthStep, AuthStrategy, SealedMessage, SecurityContext,
    CREDSSP_ENCRYPTED_PROTOCOL,
};
use crate::connection::endpoint::Endpoint;
use crate::error::{WinRmError, WinRmResult};

/// Fail with `InsecureAuthError` unless `endpoint` uses TLS.
pub fn require_tls(endpoint: &Endpoint) -> WinRmResult<()> {
    if endpoint.is_tls() {
        Ok(())
    } else {
        Err(WinRmError::InsecureAuth(
            "CredSSP delegates credentials and requires an HTTPS listener; use --use-https"
                .to_string(),
        ))
    }
}

/// CredSSP strategy.
pub struct CredSspAuth {
    context: Option<Box<dyn SecurityContext>>,
}

impl CredSspAuth {
    /// Create the strategy. Without a context, the first handshake step fails.
    pub fn new(context: Option<Box<dyn SecurityContext>>) -> Self {
        Self { context }
    }

    fn context(&mut self) -> WinRmResult<&mut Box<dyn SecurityContext>> {
        self.context.as_mut().ok_or_else(|| {
            WinRmError::authentication("no CredSSP security context is available")
        })
    }
}

impl AuthStrategy for CredSspAuth {
    fn method(&self) -> AuthMethod {
        AuthMethod::Credssp
    }

    fn check_endpoint(&self, endpoint: &Endpoint) -> WinRmResult<()> {
        require_tls(endpoint)
    }

    fn header_scheme(&self) -> &'static str {
        "CredSSP"
    }

    fn step(&mut self, server_token: Option<&[u8]>) -> WinRmResult<AuthStep> {
        self.context()?.step(server_token)
    }

    fn is_established(&self) -> bool {
        self.context
            .as_ref()
            .map(|ctx| ctx.is_established())
            .unwrap_or(false)
    }

    fn encryption_protocol(&self) -> Option<&'static str> {
        self.context.as_ref().map(|_| CREDSSP_ENCRYPTED_PROTOCOL)
    }

    fn seal(&mut self, plaintext: &[u8]) -> WinRmResult<SealedMessage> {
        self.context()?.wrap(plaintext)
    }

    fn unseal(&mut self, message: &SealedMessage) -> WinRmResult<Vec<u8>> {
        self.context()?.unwrap(message)
    }
}
