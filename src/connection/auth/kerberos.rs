//! Kerberos authentication over SPNEGO.
//!
//! The ticket exchange itself is delegated to a [`SecurityContext`] supplied by
//! a [`SecurityContextProvider`](super::SecurityContextProvider); this module
//! only targets the right service principal and plugs the context into the
//! HTTP `Negotiate` handshake.

use super::{
    AuthMethod, AuthStep, AuthStrategy, SealedMessage, SecurityContext,
    SPNEGO_ENCRYPTED_PROTOCOL,
};
use crate::connection::endpoint::Endpoint;
use crate::error::{WinRmError, WinRmResult};

/// Service principal for the WinRM listener on `endpoint`: `HTTP/<host>`,
/// qualified with `@REALM` when a realm is configured.
pub fn service_principal_name(endpoint: &Endpoint, realm: Option<&str>) -> String {
    let spn = endpoint.service_principal_name("HTTP");
    match realm {
        Some(realm) if !realm.is_empty() => format!("{}@{}", spn, realm.to_uppercase()),
        _ => spn,
    }
}

/// Kerberos strategy.
pub struct KerberosAuth {
    spn: String,
    context: Option<Box<dyn SecurityContext>>,
}

impl KerberosAuth {
    /// Create the strategy. Without a context, the first handshake step fails.
    pub fn new(spn: String, context: Option<Box<dyn SecurityContext>>) -> Self {
        Self { spn, context }
    }

    /// Target service principal.
    pub fn spn(&self) -> &str {
        &self.spn
    }

    fn context(&mut self) -> WinRmResult<&mut Box<dyn SecurityContext>> {
        let spn = &self.spn;
        self.context.as_mut().ok_or_else(|| {
            WinRmError::authentication(format!(
                "no Kerberos security context is available for {}",
                spn
            ))
        })
    }
}

impl AuthStrategy for KerberosAuth {
    fn method(&self) -> AuthMethod {
        AuthMethod::Kerberos
    }

    fn check_endpoint(&self, _endpoint: &Endpoint) -> WinRmResult<()> {
        Ok(())
    }

    fn header_scheme(&self) -> &'static str {
        "Negotiate"
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
        self.context.as_ref().map(|_| SPNEGO_ENCRYPTED_PROTOCOL)
    }

    fn seal(&mut self, plaintext: &[u8]) -> WinRmResult<SealedMessage> {
        self.context()?.wrap(plaintext)
    }

    fn unseal(&mut self, message: &SealedMessage) -> WinRmResult<Vec<u8>> {
        self.context()?.unwrap(message)
    }
}
