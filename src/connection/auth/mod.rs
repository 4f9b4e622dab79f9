//! Authentication strategies for WinRM.
//!
//! Every request to the listener is authenticated by one [`AuthStrategy`]:
//!
//! - **NTLM**: native three-message handshake with NTLMv2 session security
//! - **Kerberos**: SPNEGO exchange driven by an external [`SecurityContext`]
//! - **CredSSP**: TLS-only; exchange driven by an external [`SecurityContext`]
//! - **Basic**: static header, refused over plain HTTP
//!
//! The transport drives [`AuthStrategy::step`] until the strategy reports
//! [`AuthStep::Complete`], then asks it to sign or seal every request body.

pub mod basic;
pub mod credssp;
pub mod kerberos;
pub mod ntlm;

use std::fmt;
use std::sync::Arc;

use clap::ValueEnum;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::endpoint::Endpoint;
use crate::error::{WinRmError, WinRmResult};

pub use basic::BasicAuth;
pub use credssp::CredSspAuth;
pub use kerberos::KerberosAuth;
pub use ntlm::{NtlmAuth, NtlmContext};

/// MIME protocol of SPNEGO (NTLM/Kerberos) session-encrypted bodies.
pub const SPNEGO_ENCRYPTED_PROTOCOL: &str = "application/HTTP-SPNEGO-session-encrypted";

/// MIME protocol of CredSSP session-encrypted bodies.
pub const CREDSSP_ENCRYPTED_PROTOCOL: &str = "application/HTTP-CredSSP-session-encrypted";

/// WinRM authentication method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// NTLM challenge-response
    #[default]
    Ntlm,
    /// Kerberos via SPNEGO
    Kerberos,
    /// CredSSP (delegated credentials, HTTPS only)
    Credssp,
    /// Basic authentication (HTTPS only)
    Basic,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthMethod::Ntlm => "ntlm",
            AuthMethod::Kerberos => "kerberos",
            AuthMethod::Credssp => "credssp",
            AuthMethod::Basic => "basic",
        };
        f.write_str(name)
    }
}

/// Username and password for one invocation. Never persisted.
pub struct Credentials {
    username: String,
    password: SecretString,
    realm: Option<String>,
}

impl Credentials {
    /// Create credentials from a username (`user`, `DOMAIN\user` or
    /// `user@domain`) and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into().into_boxed_str()),
            realm: None,
        }
    }

    /// Set the Kerberos realm
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    /// The username exactly as given
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password
    pub fn password(&self) -> &SecretString {
        &self.password
    }

    /// The Kerberos realm, if any
    pub fn realm(&self) -> Option<&str> {
        self.realm.as_deref()
    }

    /// Split `DOMAIN\user` into its parts. UPN-style `user@domain` names are
    /// passed through whole; Windows resolves them with an empty domain.
    pub fn domain_and_user(&self) -> (Option<&str>, &str) {
        match self.username.split_once('\\') {
            Some((domain, user)) => (Some(domain), user),
            None => (None, self.username.as_str()),
        }
    }
}

impl Clone for Credentials {
    fn clone(&self) -> Self {
        Self {
            username: self.username.clone(),
            password: SecretString::new(self.password.expose_secret().to_owned().into_boxed_str()),
            realm: self.realm.clone(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("realm", &self.realm)
            .finish()
    }
}

/// Outcome of one handshake step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send this token to the server and feed its answer back.
    Continue(Vec<u8>),
    /// No more tokens are needed.
    Complete,
}

/// A sealed (encrypted and signed) message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    /// Message signature
    pub signature: Vec<u8>,
    /// Encrypted payload
    pub payload: Vec<u8>,
}

/// A GSS-style security context: token exchange plus message protection.
///
/// NTLM ships natively as [`NtlmContext`]. Kerberos and CredSSP contexts are
/// supplied by the embedding application through a [`SecurityContextProvider`].
pub trait SecurityContext: Send {
    /// Produce the next token, given the server's last token.
    fn step(&mut self, server_token: Option<&[u8]>) -> WinRmResult<AuthStep>;

    /// Whether the context has derived its session keys.
    fn is_established(&self) -> bool;

    /// Encrypt and sign a message for the server.
    fn wrap(&mut self, plaintext: &[u8]) -> WinRmResult<SealedMessage>;

    /// Verify and decrypt a message from the server.
    fn unwrap(&mut self, message: &SealedMessage) -> WinRmResult<Vec<u8>>;
}

/// Source of external security contexts (Kerberos, CredSSP).
pub trait SecurityContextProvider: Send + Sync {
    /// Create a context for `method` targeting the service principal `spn`.
    fn create_context(
        &self,
        method: AuthMethod,
        spn: &str,
        credentials: &Credentials,
    ) -> WinRmResult<Box<dyn SecurityContext>>;
}

/// Per-connection authentication state.
pub trait AuthStrategy: Send {
    /// The method this strategy implements.
    fn method(&self) -> AuthMethod;

    /// Reject endpoints this strategy must not be used with. Called before any
    /// network traffic.
    fn check_endpoint(&self, endpoint: &Endpoint) -> WinRmResult<()>;

    /// Scheme name used in `Authorization` and `WWW-Authenticate` headers.
    fn header_scheme(&self) -> &'static str;

    /// Advance the pre-flight handshake.
    fn step(&mut self, server_token: Option<&[u8]>) -> WinRmResult<AuthStep>;

    /// Whether the handshake has completed.
    fn is_established(&self) -> bool;

    /// Static `Authorization` header sent with every request, if any.
    fn authorization(&self) -> Option<String> {
        None
    }

    /// MIME protocol used for session-encrypted bodies; `None` when this
    /// strategy cannot seal messages.
    fn encryption_protocol(&self) -> Option<&'static str> {
        None
    }

    /// Seal an outgoing body.
    fn seal(&mut self, _plaintext: &[u8]) -> WinRmResult<SealedMessage> {
        Err(WinRmError::Unexpected(format!(
            "{} authentication cannot encrypt messages",
            self.method()
        )))
    }

    /// Unseal an incoming body.
    fn unseal(&mut self, _message: &SealedMessage) -> WinRmResult<Vec<u8>> {
        Err(WinRmError::Unexpected(format!(
            "{} authentication cannot decrypt messages",
            self.method()
        )))
    }
}

/// Build the strategy for `method`, checking it against `endpoint` first.
pub fn strategy_for(
    method: AuthMethod,
    credentials: &Credentials,
    endpoint: &Endpoint,
    provider: Option<&dyn SecurityContextProvider>,
) -> WinRmResult<Box<dyn AuthStrategy>> {
    let strategy: Box<dyn AuthStrategy> = match method {
        AuthMethod::Basic => Box::new(BasicAuth::new(credentials)),
        AuthMethod::Ntlm => Box::new(NtlmAuth::new(credentials)),
        AuthMethod::Kerberos => {
            let spn = kerberos::service_principal_name(endpoint, credentials.realm());
            let context = provider
                .map(|p| p.create_context(method, &spn, credentials))
                .transpose()?;
            Box::new(KerberosAuth::new(spn, context))
        }
        AuthMethod::Credssp => {
            // TLS is a precondition of CredSSP; check before asking for a context.
            credssp::require_tls(endpoint)?;
            let spn = endpoint.service_principal_name("HTTP");
            let context = provider
                .map(|p| p.create_context(method, &spn, credentials))
                .transpose()?;
            Box::new(CredSspAuth::new(context))
        }
    };

    strategy.check_endpoint(endpoint)?;
    Ok(strategy)
}

/// Builds fresh strategies for one endpoint.
///
/// NTLM, Kerberos and CredSSP authenticate a single TCP connection. When that
/// connection is lost the transport asks for a new strategy and repeats the
/// handshake.
pub struct AuthFactory {
    method: AuthMethod,
    credentials: Credentials,
    endpoint: Endpoint,
    provider: Option<Arc<dyn SecurityContextProvider>>,
}

impl AuthFactory {
    /// Create a factory for `method` against `endpoint`.
    pub fn new(method: AuthMethod, credentials: Credentials, endpoint: Endpoint) -> Self {
        Self {
            method,
            credentials,
            endpoint,
            provider: None,
        }
    }

    /// Supply Kerberos / CredSSP security contexts
    pub fn with_provider(mut self, provider: Option<Arc<dyn SecurityContextProvider>>) -> Self {
        self.provider = provider;
        self
    }

    /// The method every built strategy implements
    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// The endpoint strategies are checked against
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// A new, unauthenticated strategy. Fails before any I/O when the method
    /// cannot be used with the endpoint.
    pub fn build(&self) -> WinRmResult<Box<dyn AuthStrategy>> {
        strategy_for(
            self.method,
            &self.credentials,
            &self.endpoint,
            self.provider.as_deref(),
        )
    }
}

impl fmt::Debug for AuthFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthFactory")
            .field("method", &self.method)
            .field("credentials", &self.credentials)
            .field("endpoint", &self.endpoint)
            .field("has_provider", &self.provider.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::endpoint::Scheme;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Two-leg context that reverses payloads when sealing.
    #[derive(Default)]
    pub(crate) struct MirrorContext {
        established: bool,
    }

    impl SecurityContext for MirrorContext {
        fn step(&mut self, server_token: Option<&[u8]>) -> WinRmResult<AuthStep> {
            match server_token {
                None => Ok(AuthStep::Continue(b"client-token".to_vec())),
                Some(b"server-token") => {
                    self.established = true;
                    Ok(AuthStep::Complete)
                }
                Some(_) => Err(WinRmError::authentication("unexpected server token")),
            }
        }

        fn is_established(&self) -> bool {
            self.established
        }

        fn wrap(&mut self, plaintext: &[u8]) -> WinRmResult<SealedMessage> {
            Ok(SealedMessage {
                signature: b"sig".to_vec(),
                payload: plaintext.iter().rev().copied().collect(),
            })
        }

        fn unwrap(&mut self, message: &SealedMessage) -> WinRmResult<Vec<u8>> {
            if message.signature != b"sig" {
                return Err(WinRmError::authentication("bad signature"));
            }
            Ok(message.payload.iter().rev().copied().collect())
        }
    }

    #[derive(Default)]
    struct CountingProvider {
        calls: AtomicUsize,
    }

    impl SecurityContextProvider for CountingProvider {
        fn create_context(
            &self,
            _method: AuthMethod,
            _spn: &str,
            _credentials: &Credentials,
        ) -> WinRmResult<Box<dyn SecurityContext>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MirrorContext::default()))
        }
    }

    fn http_endpoint() -> Endpoint {
        Endpoint::resolve("winhost", 5985, Scheme::Http).unwrap()
    }

    fn https_endpoint() -> Endpoint {
        Endpoint::resolve("winhost", 5986, Scheme::Https).unwrap()
    }

    #[test]
    fn test_domain_user_split() {
        let creds = Credentials::new("CORP\\admin", "secret");
        assert_eq!(creds.domain_and_user(), (Some("CORP"), "admin"));

        let upn = Credentials::new("admin@corp.local", "secret");
        assert_eq!(upn.domain_and_user(), (None, "admin@corp.local"));

        let plain = Credentials::new("admin", "secret");
        assert_eq!(plain.domain_and_user(), (None, "admin"));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("admin", "hunter2");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(creds.password().expose_secret(), "hunter2");
    }

    #[test]
    fn test_basic_over_http_is_insecure() {
        let creds = Credentials::new("admin", "secret");
        let err = strategy_for(AuthMethod::Basic, &creds, &http_endpoint(), None)
            .err()
            .expect("basic over http must fail");
        assert!(matches!(err, WinRmError::InsecureAuth(_)));
    }

    #[test]
    fn test_basic_over_https_is_allowed() {
        let creds = Credentials::new("admin", "secret");
        let strategy = strategy_for(AuthMethod::Basic, &creds, &https_endpoint(), None).unwrap();
        assert_eq!(strategy.method(), AuthMethod::Basic);
        assert!(strategy.authorization().is_some());
    }

    #[test]
    fn test_credssp_requires_tls() {
        let creds = Credentials::new("admin", "secret");
        let err = strategy_for(AuthMethod::Credssp, &creds, &http_endpoint(), None)
            .err()
            .expect("credssp over http must fail");
        assert!(matches!(err, WinRmError::InsecureAuth(_)));
    }

    #[test]
    fn test_ntlm_strategy_can_seal() {
        let creds = Credentials::new("admin", "secret");
        let strategy = strategy_for(AuthMethod::Ntlm, &creds, &http_endpoint(), None).unwrap();
        assert_eq!(strategy.header_scheme(), "Negotiate");
        assert_eq!(strategy.encryption_protocol(), Some(SPNEGO_ENCRYPTED_PROTOCOL));
        assert!(!strategy.is_established());
    }

    #[test]
    fn test_kerberos_without_provider_fails_on_first_step() {
        let creds = Credentials::new("admin", "secret");
        let mut strategy =
            strategy_for(AuthMethod::Kerberos, &creds, &http_endpoint(), None).unwrap();
        let err = strategy.step(None).unwrap_err();
        assert!(matches!(err, WinRmError::Authentication { .. }));
        assert!(err.to_string().contains("HTTP/winhost"));
    }

    #[test]
    fn test_credentials_clone_keeps_secret() {
        let creds = Credentials::new("CORP\\admin", "hunter2").with_realm("corp.local");
        let copy = creds.clone();
        assert_eq!(copy.username(), "CORP\\admin");
        assert_eq!(copy.password().expose_secret(), "hunter2");
        assert_eq!(copy.realm(), Some("corp.local"));
    }

    #[test]
    fn test_factory_builds_independent_strategies() {
        let factory = AuthFactory::new(
            AuthMethod::Ntlm,
            Credentials::new("admin", "secret"),
            http_endpoint(),
        );

        let mut first = factory.build().unwrap();
        assert!(matches!(first.step(None).unwrap(), AuthStep::Continue(_)));

        // a fresh strategy starts the handshake over
        let mut second = factory.build().unwrap();
        assert!(!second.is_established());
        let AuthStep::Continue(token) = second.step(None).unwrap() else {
            panic!("expected a negotiate token");
        };
        assert_eq!(&token[..8], b"NTLMSSP\0");
        assert_eq!(token[8], 1);
    }

    #[test]
    fn test_factory_rejects_insecure_endpoint() {
        let factory = AuthFactory::new(
            AuthMethod::Basic,
            Credentials::new("admin", "secret"),
            http_endpoint(),
        );
        assert!(matches!(factory.build(), Err(WinRmError::InsecureAuth(_))));
    }

    #[test]
    fn test_provider_context_drives_kerberos() {
        let provider = CountingProvider::default();
        let creds = Credentials::new("admin", "secret");
        let mut strategy =
            strategy_for(AuthMethod::Kerberos, &creds, &http_endpoint(), Some(&provider)).unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(strategy.header_scheme(), "Negotiate");
        assert_eq!(strategy.encryption_protocol(), Some(SPNEGO_ENCRYPTED_PROTOCOL));
        assert_eq!(
            strategy.step(None).unwrap(),
            AuthStep::Continue(b"client-token".to_vec())
        );
        assert_eq!(strategy.step(Some(b"server-token")).unwrap(), AuthStep::Complete);
        assert!(strategy.is_established());
    }

    #[test]
    fn test_credssp_checks_tls_before_asking_provider() {
        let provider = CountingProvider::default();
        let creds = Credentials::new("admin", "secret");

        let err = strategy_for(AuthMethod::Credssp, &creds, &http_endpoint(), Some(&provider))
            .err()
            .expect("credssp over http must fail");
        assert!(matches!(err, WinRmError::InsecureAuth(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        let strategy =
            strategy_for(AuthMethod::Credssp, &creds, &https_endpoint(), Some(&provider)).unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(strategy.header_scheme(), "CredSSP");
        assert_eq!(strategy.encryption_protocol(), Some(CREDSSP_ENCRYPTED_PROTOCOL));
    }

    #[test]
    fn test_method_display_matches_cli_values() {
        for method in AuthMethod::value_variants() {
            let value = method.to_possible_value().unwrap();
            assert_eq!(value.get_name(), method.to_string());
        }
    }
}
