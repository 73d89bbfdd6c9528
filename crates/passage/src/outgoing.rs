//! Outgoing request construction.
//!
//! Builds the outbound request descriptor from the resolved destination, the
//! inbound request head and the effective options, per the header, path and
//! connection-policy contract of the proxy.

use std::net::IpAddr;

use base64::Engine;
use hyper::header::{HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, HOST};
use hyper::http::request;
use hyper::http::uri::Uri;
use hyper::{HeaderMap, Method, Request};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::body::ProxyBody;
use crate::client::Agent;
use crate::error::ProxyError;
use crate::options::ProxyOptions;
use crate::target::{port_required, ResolvedTarget, TargetTls};

/// Matches a `Connection` header that names the `upgrade` token.
static UPGRADE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(^|,)\s*upgrade\s*($|,)").unwrap());

/// Collapses runs of slashes while joining path segments.
static SLASH_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/+").unwrap());

/// Which destination of the options record to build against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    Target,
    Forward,
}

/// The outbound request descriptor produced by [`build_outgoing`].
#[derive(Clone)]
pub struct OutgoingRequest {
    pub method: Method,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub headers: HeaderMap,
    /// Verify the upstream certificate when the scheme is secure.
    pub secure: bool,
    pub local_address: Option<IpAddr>,
    pub tls: Option<TargetTls>,
    /// Connection pool handle; `None` means a fresh connection per request.
    pub agent: Option<Agent>,
}

impl OutgoingRequest {
    /// Whether the outbound scheme implies TLS.
    pub fn is_secure(&self) -> bool {
        matches!(self.scheme.as_str(), "https" | "wss")
    }

    /// Absolute URI for the pooled client. WebSocket schemes map onto their
    /// HTTP equivalents; upgrade negotiation rides on the headers.
    pub fn uri(&self) -> Result<Uri, ProxyError> {
        let scheme = match self.scheme.as_str() {
            "wss" => "https",
            "ws" => "http",
            other => other,
        };
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        Uri::builder()
            .scheme(scheme)
            .authority(format!("{}:{}", self.host, self.port))
            .path_and_query(path)
            .build()
            .map_err(ProxyError::from)
    }

    /// Materialize an `http::Request` with an absolute URI and this
    /// descriptor's method and headers.
    pub fn into_request(self, body: ProxyBody) -> Result<Request<ProxyBody>, ProxyError> {
        let uri = self.uri()?;
        let mut req = Request::builder().method(self.method).uri(uri).body(body)?;
        *req.headers_mut() = self.headers;
        Ok(req)
    }

    /// Materialize an origin-form `http::Request` for a raw HTTP/1.1
    /// connection that was dialed separately.
    pub fn into_origin_request(self, body: ProxyBody) -> Result<Request<ProxyBody>, ProxyError> {
        let path = if self.path.is_empty() {
            "/".to_string()
        } else {
            self.path.clone()
        };
        let mut req = Request::builder().method(self.method).uri(path).body(body)?;
        *req.headers_mut() = self.headers;
        Ok(req)
    }
}

/// Build the outbound request descriptor for `which` destination.
pub fn build_outgoing(
    options: &ProxyOptions,
    inbound: &request::Parts,
    which: Which,
) -> Result<OutgoingRequest, ProxyError> {
    let resolved: &ResolvedTarget = match which {
        Which::Target => options.resolved_target(),
        Which::Forward => options.resolved_forward(),
    }
    .ok_or(ProxyError::MissingTarget)?;

    let method = match &options.method {
        Some(m) => Method::from_bytes(m.as_bytes()).map_err(|_| ProxyError::InvalidTarget {
            url: m.clone(),
            reason: "invalid method override".to_string(),
        })?,
        None => inbound.method.clone(),
    };

    // Shallow copy of the inbound headers, overlaid with the configured ones.
    let mut headers = inbound.headers.clone();
    if let Some(extra) = &options.headers {
        for (name, value) in extra {
            let name = match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => name,
                Err(_) => {
                    warn!(header = %name, "skipping invalid configured header name");
                    continue;
                }
            };
            let value = match HeaderValue::from_str(value) {
                Ok(value) => value,
                Err(_) => {
                    warn!(header = %name, "skipping invalid configured header value");
                    continue;
                }
            };
            headers.insert(name, value);
        }
    }

    if let Some(auth) = &options.auth {
        let encoded = base64::engine::general_purpose::STANDARD.encode(auth.as_bytes());
        if let Ok(value) = HeaderValue::from_str(&format!("Basic {encoded}")) {
            headers.insert(AUTHORIZATION, value);
        }
    }

    // Agent selection follows the outbound scheme. Without an agent the
    // connection is not pooled and must be torn down, unless the request is
    // itself negotiating an upgrade.
    let agent = if resolved.is_secure() {
        options.https_agent.clone()
    } else {
        options.http_agent.clone()
    };
    if agent.is_none() {
        let has_upgrade = headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| UPGRADE_RE.is_match(v))
            .unwrap_or(false);
        if !has_upgrade {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }
    }

    let raw_target: String;
    let outgoing_path: &str = if options.to_proxy_enabled() {
        raw_target = inbound.uri.to_string();
        raw_target.as_str()
    } else {
        inbound
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("")
    };
    let outgoing_path = if options.ignore_path_enabled() {
        ""
    } else {
        outgoing_path
    };
    let target_path = if options.prepend_path_enabled() {
        resolved.path.as_str()
    } else {
        ""
    };
    let path = url_join(&[target_path, outgoing_path]);

    if options.change_origin_enabled() {
        let host = if port_required(resolved.port, &resolved.scheme) && !resolved.host.contains(':')
        {
            format!("{}:{}", resolved.host, resolved.port)
        } else {
            resolved.host.clone()
        };
        if let Ok(value) = HeaderValue::from_str(&host) {
            headers.insert(HOST, value);
        }
    }

    Ok(OutgoingRequest {
        method,
        scheme: resolved.scheme.clone(),
        host: resolved.host.clone(),
        port: resolved.port,
        path,
        headers,
        secure: options.secure_enabled(),
        local_address: options.local_address,
        tls: resolved.tls.clone(),
        agent,
    })
}

/// Join URL fragments with `/`, collapsing slash runs (but preserving the
/// `://` after `http`/`https`). The query string of the last fragment is
/// split off before joining and re-appended; additional `?` segments are
/// preserved verbatim after the first.
pub fn url_join(parts: &[&str]) -> String {
    if parts.is_empty() {
        return String::new();
    }
    let mut query_segments = parts[parts.len() - 1].split('?');
    let last_path = query_segments.next().unwrap_or("");
    let queries: Vec<&str> = query_segments.collect();

    let mut path_parts: Vec<&str> = parts[..parts.len() - 1].to_vec();
    path_parts.push(last_path);
    let joined = path_parts
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    let collapsed = SLASH_RUN_RE.replace_all(&joined, "/").into_owned();
    let fixed = collapsed
        .replacen("http:/", "http://", 1)
        .replacen("https:/", "https://", 1);

    let mut result = fixed;
    for query in queries {
        result.push('?');
        result.push_str(query);
    }
    result
}
