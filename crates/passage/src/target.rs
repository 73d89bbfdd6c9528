//! Target resolution.
//!
//! Turns the `target`/`forward` strings from the options record into a
//! structured URL record. TLS material configured on a parsed target is left
//! attached, untouched, for the outgoing request builder to consume.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ProxyError;

/// Schemes that imply TLS and default to port 443.
static SECURE_SCHEME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https|wss$").unwrap());

/// An upstream destination: either a URL string still to be parsed, or an
/// already-resolved record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Url(String),
    Resolved(ResolvedTarget),
}

impl From<&str> for Target {
    fn from(url: &str) -> Self {
        Target::Url(url.to_string())
    }
}

impl From<String> for Target {
    fn from(url: String) -> Self {
        Target::Url(url)
    }
}

impl From<ResolvedTarget> for Target {
    fn from(resolved: ResolvedTarget) -> Self {
        Target::Resolved(resolved)
    }
}

impl Target {
    /// Resolve to a structured record, parsing the URL form if necessary.
    pub fn resolve(&self) -> Result<ResolvedTarget, ProxyError> {
        match self {
            Target::Resolved(resolved) => Ok(resolved.clone()),
            Target::Url(raw) => ResolvedTarget::parse(raw),
        }
    }

    /// The already-resolved record, if resolution has happened.
    pub fn as_resolved(&self) -> Option<&ResolvedTarget> {
        match self {
            Target::Resolved(resolved) => Some(resolved),
            Target::Url(_) => None,
        }
    }
}

/// TLS material attached to a target, consumed by the outgoing request
/// builder when the upstream scheme is secure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetTls {
    /// Extra CA bundle (PEM) trusted for this upstream.
    pub ca: Option<PathBuf>,
    /// Client certificate chain (PEM) presented to the upstream.
    pub cert: Option<PathBuf>,
    /// Client private key (PEM).
    pub key: Option<PathBuf>,
}

impl TargetTls {
    pub fn is_empty(&self) -> bool {
        self.ca.is_none() && self.cert.is_none() && self.key.is_none()
    }
}

/// A parsed upstream URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedTarget {
    /// URL scheme without the trailing colon (`http`, `https`, `ws`, `wss`).
    pub scheme: String,
    /// Hostname, without port.
    pub host: String,
    /// Explicit port, or the scheme default (443 for `https`/`wss`, else 80).
    pub port: u16,
    /// Path plus query string, exactly as given.
    pub path: String,
    /// TLS material for the outgoing connection, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TargetTls>,
}

impl ResolvedTarget {
    /// Parse a URL string into a resolved record.
    pub fn parse(raw: &str) -> Result<ResolvedTarget, ProxyError> {
        let url = Url::parse(raw).map_err(|e| ProxyError::InvalidTarget {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        let scheme = url.scheme().to_string();
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::InvalidTarget {
                url: raw.to_string(),
                reason: "missing host".to_string(),
            })?
            .to_string();
        let port = url.port().unwrap_or_else(|| default_port(&scheme));
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(ResolvedTarget {
            scheme,
            host,
            port,
            path,
            tls: None,
        })
    }

    /// Whether the scheme implies a TLS connection.
    pub fn is_secure(&self) -> bool {
        SECURE_SCHEME_RE.is_match(&self.scheme)
    }

    /// `host:port` authority string.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Authority string as it would appear in a URL: the port is elided when
    /// it is the well-known port for the scheme.
    pub fn url_authority(&self) -> String {
        if port_required(self.port, &self.scheme) {
            self.authority()
        } else {
            self.host.clone()
        }
    }
}

/// Default port for a scheme: 443 for `https`/`wss`, otherwise 80.
pub fn default_port(scheme: &str) -> u16 {
    if SECURE_SCHEME_RE.is_match(scheme) {
        443
    } else {
        80
    }
}

/// True when `port` must appear explicitly in a URL of the given scheme.
pub fn port_required(port: u16, scheme: &str) -> bool {
    port != default_port(scheme)
}
