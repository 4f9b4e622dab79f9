//! Transport session.
//!
//! [`Transport`] is the seam between the command executor and the network:
//! one operation, `send(envelope) -> body`. [`HttpTransport`] implements it
//! over a single `reqwest` client, performs the authentication handshake
//! before the first request and, when message encryption is active, wraps
//! bodies in the MS-WSMV `multipart/encrypted` framing.
//!
//! The handshake authenticates one TCP connection. After a timeout, a connect
//! failure or an exchange that was dropped before it finished, the connection
//! is gone, so the next request starts over with a fresh strategy.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use tracing::{debug, trace};

use super::auth::{AuthFactory, AuthStep, AuthStrategy, SealedMessage};
use super::config::{CertValidation, ConnectionConfig, MessageEncryption};
use super::endpoint::Endpoint;
use super::soap::Envelope;
use crate::error::{TransportErrorKind, WinRmError, WinRmResult};

/// Content type of plain SOAP bodies
pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

const ENCRYPTED_BOUNDARY: &str = "Encrypted Boundary";

const USER_AGENT: &str = concat!("winrm-exec/", env!("CARGO_PKG_VERSION"));

/// Something that can carry an envelope to the listener and return the reply.
#[async_trait]
pub trait Transport: Send {
    /// Endpoint this transport talks to
    fn endpoint(&self) -> &Endpoint;

    /// Send one envelope and return the response body.
    ///
    /// SOAP faults are returned as bodies; the decoder turns them into errors.
    async fn send(&mut self, envelope: &Envelope) -> WinRmResult<String>;
}

/// HTTP(S) transport backed by `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Endpoint,
    factory: AuthFactory,
    auth: Box<dyn AuthStrategy>,
    encrypt: bool,
    authenticated: bool,
    connection_lost: bool,
}

impl HttpTransport {
    /// Build the client for the factory's endpoint with the policies in
    /// `config`. Fails before any I/O when the auth method is unusable.
    pub fn new(config: &ConnectionConfig, factory: AuthFactory) -> WinRmResult<Self> {
        let endpoint = factory.endpoint().clone();
        let auth = factory.build()?;
        let encrypt = should_encrypt(config.message_encryption, &endpoint, auth.as_ref())?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.cert_validation == CertValidation::Ignore)
            .pool_max_idle_per_host(1)
            .http1_only()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| WinRmError::Transport {
                kind: TransportErrorKind::Other,
                message: format!("failed to build HTTP client: {}", e),
                source: Some(Box::new(e)),
            })?;

        debug!(
            endpoint = %endpoint,
            auth = %auth.method(),
            encrypt,
            "created WinRM transport"
        );

        Ok(Self {
            client,
            endpoint,
            factory,
            auth,
            encrypt,
            authenticated: false,
            connection_lost: false,
        })
    }

    /// Whether bodies are sealed.
    pub fn is_encrypted(&self) -> bool {
        self.encrypt
    }

    /// Discard the security context of a connection that no longer exists.
    fn reset_authentication(&mut self) -> WinRmResult<()> {
        debug!(
            method = %self.factory.method(),
            "authenticated connection lost, repeating the handshake"
        );
        self.auth = self.factory.build()?;
        self.authenticated = false;
        Ok(())
    }

    /// Drive the pre-flight handshake with empty-bodied POSTs.
    async fn authenticate(&mut self) -> WinRmResult<()> {
        let scheme = self.auth.header_scheme();
        let mut server_token: Option<Vec<u8>> = None;
        let mut round = 0u32;

        loop {
            let token = match self.auth.step(server_token.as_deref())? {
                AuthStep::Complete => break,
                AuthStep::Continue(token) => token,
            };
            round += 1;
            trace!(scheme, round, len = token.len(), "sending authentication token");

            let response = self
                .client
                .post(self.endpoint.url())
                .header(AUTHORIZATION, format!("{} {}", scheme, BASE64.encode(&token)))
                .body(Vec::new())
                .send()
                .await
                .map_err(|e| {
                    WinRmError::authentication_with(
                        format!("{} handshake request failed", scheme),
                        WinRmError::from(e),
                    )
                })?;

            let status = response.status();
            let reply = server_token_from(response.headers(), scheme)?;

            if status == StatusCode::UNAUTHORIZED {
                match reply {
                    Some(reply) if !self.auth.is_established() => server_token = Some(reply),
                    _ => {
                        return Err(WinRmError::authentication(format!(
                            "server rejected the {} credentials (HTTP 401)",
                            self.auth.method()
                        )))
                    }
                }
            } else if status.is_success() {
                if let Some(reply) = reply {
                    // Final mutual-authentication token
                    if let AuthStep::Continue(_) = self.auth.step(Some(&reply))? {
                        return Err(WinRmError::authentication(
                            "server accepted the request before the handshake finished",
                        ));
                    }
                }
                if !self.auth.is_established() {
                    return Err(WinRmError::authentication(
                        "server accepted the request before the security context was established",
                    ));
                }
                break;
            } else {
                return Err(WinRmError::authentication(format!(
                    "unexpected HTTP status {} during {} handshake",
                    status.as_u16(),
                    scheme
                )));
            }
        }

        debug!(method = %self.auth.method(), rounds = round, "authentication complete");
        Ok(())
    }

    /// One request on an authenticated connection.
    async fn exchange(&mut self, envelope: &Envelope) -> WinRmResult<String> {
        debug!(
            action = %envelope.action,
            message_id = %envelope.message_id,
            encrypted = self.encrypt,
            "sending WS-Management request"
        );

        let mut request = self.client.post(self.endpoint.url());
        if let Some(header) = self.auth.authorization() {
            request = request.header(AUTHORIZATION, header);
        }

        let request = if self.encrypt {
            let protocol = self.auth.encryption_protocol().ok_or_else(|| {
                WinRmError::Unexpected("encryption enabled without a sealing strategy".to_string())
            })?;
            let sealed = self.auth.seal(envelope.xml.as_bytes())?;
            request
                .header(CONTENT_TYPE, encrypted_content_type(protocol))
                .body(frame_encrypted(protocol, envelope.xml.len(), &sealed))
        } else {
            request
                .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
                .body(envelope.xml.clone())
        };

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.bytes().await?;

        trace!(status = status.as_u16(), len = bytes.len(), "received response");

        match status {
            StatusCode::UNAUTHORIZED => {
                return Err(WinRmError::authentication(format!(
                    "{} request rejected with HTTP 401 after authentication",
                    envelope.action
                )))
            }
            StatusCode::OK | StatusCode::INTERNAL_SERVER_ERROR => {}
            other => {
                return Err(WinRmError::transport(
                    TransportErrorKind::Status(other.as_u16()),
                    format!("{} returned HTTP {}", self.endpoint, other.as_u16()),
                ))
            }
        }

        let body = self.decode_body(&headers, &bytes)?;
        if status == StatusCode::INTERNAL_SERVER_ERROR && body.trim().is_empty() {
            return Err(WinRmError::transport(
                TransportErrorKind::Status(500),
                format!("{} returned HTTP 500 without a SOAP body", self.endpoint),
            ));
        }

        Ok(body)
    }

    fn decode_body(&mut self, headers: &HeaderMap, bytes: &[u8]) -> WinRmResult<String> {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if !content_type.starts_with("multipart/encrypted") {
            return Ok(String::from_utf8_lossy(bytes).into_owned());
        }

        let (sealed, expected_len) = parse_encrypted(bytes)?;
        let plaintext = self.auth.unseal(&sealed)?;
        if plaintext.len() != expected_len {
            return Err(WinRmError::Unexpected(format!(
                "decrypted body is {} bytes, expected {}",
                plaintext.len(),
                expected_len
            )));
        }
        String::from_utf8(plaintext)
            .map_err(|e| WinRmError::Unexpected(format!("decrypted body is not UTF-8: {}", e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn send(&mut self, envelope: &Envelope) -> WinRmResult<String> {
        if self.connection_lost {
            self.reset_authentication()?;
        }
        // Stays set if this future is dropped before the exchange completes.
        self.connection_lost = true;

        if !self.authenticated {
            self.authenticate().await?;
            self.authenticated = true;
        }

        let result = self.exchange(envelope).await;
        self.connection_lost = matches!(&result, Err(e) if loses_connection(e));
        result
    }
}

/// Whether `error` means the authenticated connection was closed.
fn loses_connection(error: &WinRmError) -> bool {
    matches!(
        error,
        WinRmError::Transport {
            kind: TransportErrorKind::Timeout | TransportErrorKind::Connect | TransportErrorKind::Other,
            ..
        }
    )
}

/// Decide whether to seal bodies.
fn should_encrypt(
    policy: MessageEncryption,
    endpoint: &Endpoint,
    auth: &dyn AuthStrategy,
) -> WinRmResult<bool> {
    let can_seal = auth.encryption_protocol().is_some();
    match policy {
        MessageEncryption::Never => Ok(false),
        MessageEncryption::Auto => Ok(can_seal && !endpoint.is_tls()),
        MessageEncryption::Always if can_seal => Ok(true),
        MessageEncryption::Always => Err(WinRmError::Config(format!(
            "message encryption is not available with {} authentication",
            auth.method()
        ))),
    }
}

/// Token carried in `WWW-Authenticate: <scheme> <base64>`, if any.
fn server_token_from(headers: &HeaderMap, scheme: &str) -> WinRmResult<Option<Vec<u8>>> {
    for value in headers.get_all(WWW_AUTHENTICATE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for challenge in value.split(',') {
            let challenge = challenge.trim();
            let Some((name, token)) = challenge.split_once(' ') else {
                continue;
            };
            if name.eq_ignore_ascii_case(scheme) {
                let token = BASE64.decode(token.trim()).map_err(|e| {
                    WinRmError::authentication_with(
                        format!("malformed {} token from server", scheme),
                        e,
                    )
                })?;
                return Ok(Some(token));
            }
        }
    }
    Ok(None)
}

/// `Content-Type` of a session-encrypted body.
pub fn encrypted_content_type(protocol: &str) -> String {
    format!(
        "multipart/encrypted;protocol=\"{}\";boundary=\"{}\"",
        protocol, ENCRYPTED_BOUNDARY
    )
}

/// Frame a sealed message as `multipart/encrypted`.
pub fn frame_encrypted(protocol: &str, original_len: usize, sealed: &SealedMessage) -> Vec<u8> {
    let mut body = format!(
        "--{b}\r\n\tContent-Type: {protocol}\r\n\tOriginalContent: type=application/soap+xml;charset=UTF-8;Length={len}\r\n--{b}\r\n\tContent-Type: application/octet-stream\r\n",
        b = ENCRYPTED_BOUNDARY,
        protocol = protocol,
        len = original_len,
    )
    .into_bytes();
    body.extend_from_slice(&(sealed.signature.len() as u32).to_le_bytes());
    body.extend_from_slice(&sealed.signature);
    body.extend_from_slice(&sealed.payload);
    body.extend_from_slice(format!("--{}--\r\n", ENCRYPTED_BOUNDARY).as_bytes());
    body
}

/// Parse a `multipart/encrypted` body into the sealed message and the
/// advertised plaintext length.
pub fn parse_encrypted(body: &[u8]) -> WinRmResult<(SealedMessage, usize)> {
    let malformed = |what: &str| WinRmError::Unexpected(format!("malformed encrypted body: {}", what));

    let length_marker = b"Length=";
    let len_start = find_bytes(body, length_marker)
        .ok_or_else(|| malformed("missing OriginalContent length"))?
        + length_marker.len();
    let len_end = body[len_start..]
        .iter()
        .position(|b| !b.is_ascii_digit())
        .map(|p| len_start + p)
        .unwrap_or(body.len());
    let expected_len: usize = std::str::from_utf8(&body[len_start..len_end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed("invalid OriginalContent length"))?;

    let data_marker = b"application/octet-stream\r\n";
    let data_start = find_bytes(body, data_marker)
        .ok_or_else(|| malformed("missing encrypted part"))?
        + data_marker.len();
    let closing = format!("--{}--", ENCRYPTED_BOUNDARY);
    let data_end = rfind_bytes(body, closing.as_bytes())
        .filter(|end| *end >= data_start)
        .ok_or_else(|| malformed("missing closing boundary"))?;
    let data = &body[data_start..data_end];

    if data.len() < 4 {
        return Err(malformed("truncated signature length"));
    }
    let sig_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() < 4 + sig_len {
        return Err(malformed("truncated signature"));
    }

    Ok((
        SealedMessage {
            signature: data[4..4 + sig_len].to_vec(),
            payload: data[4 + sig_len..].to_vec(),
        },
        expected_len,
    ))
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}
