//! Endpoint resolution.
//!
//! Turns a host, port and scheme into the `scheme://host:port/wsman` URL every
//! WS-Management request is posted to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{WinRmError, WinRmResult};

/// Default WinRM HTTP port
pub const DEFAULT_WINRM_PORT: u16 = 5985;

/// Default WinRM HTTPS port
pub const DEFAULT_WINRM_SSL_PORT: u16 = 5986;

/// Path of the WS-Management listener.
const WSMAN_PATH: &str = "/wsman";

/// URL scheme of the WinRM listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plain HTTP (port 5985 by convention)
    Http,
    /// HTTP over TLS (port 5986 by convention)
    Https,
}

impl Scheme {
    /// Pick the scheme from the `--use-https` flag.
    pub fn from_use_https(use_https: bool) -> Self {
        if use_https {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }

    /// The conventional listener port for this scheme.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => DEFAULT_WINRM_PORT,
            Scheme::Https => DEFAULT_WINRM_SSL_PORT,
        }
    }

    /// Scheme as it appears in a URL.
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = WinRmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(WinRmError::Config(format!(
                "unsupported scheme '{}', expected http or https",
                other
            ))),
        }
    }
}

/// A validated WinRM endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
    url: String,
}

impl Endpoint {
    /// Resolve and validate an endpoint.
    ///
    /// `port` is taken as a wide integer so that out-of-range values coming
    /// from the command line are reported as `ConfigError` rather than being
    /// truncated.
    pub fn resolve(host: &str, port: u32, scheme: Scheme) -> WinRmResult<Self> {
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                WinRmError::Config(format!("port {} is outside the range 1-65535", port))
            })?;

        let host = normalize_host(host)?;
        let url = format!("{}://{}:{}{}", scheme, host, port, WSMAN_PATH);

        url::Url::parse(&url)
            .map_err(|e| WinRmError::Config(format!("invalid endpoint '{}': {}", url, e)))?;

        Ok(Self {
            scheme,
            host,
            port,
            url,
        })
    }

    /// Parse a scheme string and resolve.
    pub fn resolve_str(host: &str, port: u32, scheme: &str) -> WinRmResult<Self> {
        Self::resolve(host, port, scheme.parse()?)
    }

    /// The full `scheme://host:port/wsman` URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Host as used in the URL (IPv6 literals are bracketed).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Listener port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Listener scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Whether requests travel over TLS.
    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// Service principal name for `service` on this host, e.g. `HTTP/server01`.
    pub fn service_principal_name(&self, service: &str) -> String {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        format!("{}/{}", service, host)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

fn normalize_host(host: &str) -> WinRmResult<String> {
    let host = host.trim();
    if host.is_empty() {
        return Err(WinRmError::Config("host must not be empty".to_string()));
    }

    if host
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '@' | '?' | '#'))
    {
        return Err(WinRmError::Config(format!(
            "host '{}' contains characters that are not allowed in a hostname",
            host
        )));
    }

    // Bare IPv6 literal
    if host.contains(':') && !host.starts_with('[') {
        return Ok(format!("[{}]", host));
    }

    Ok(host.to_string())
}
