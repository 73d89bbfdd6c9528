//! The proxy configuration record.
//!
//! One [`ProxyOptions`] value can be attached to the server and another
//! passed per call; the per-call record is shallow-merged over the server's
//! (a field set per call wins). Unknown knobs do not exist: every recognized
//! field is typed here.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::Agent;
use crate::error::ProxyError;
use crate::target::{ResolvedTarget, Target};

/// Listener TLS material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Value-rewrite table used for `Set-Cookie` domain/path rewriting.
///
/// A bare string behaves as a `"*"` wildcard mapping. An empty replacement
/// removes the attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RewriteMap {
    Single(String),
    Map(HashMap<String, String>),
}

impl RewriteMap {
    /// Replacement for `previous`: `None` leaves the attribute untouched,
    /// `Some("")` removes it, any other value substitutes it.
    pub fn replacement_for(&self, previous: &str) -> Option<&str> {
        match self {
            RewriteMap::Single(value) => Some(value.as_str()),
            RewriteMap::Map(map) => map
                .get(previous)
                .or_else(|| map.get("*"))
                .map(|s| s.as_str()),
        }
    }
}

impl From<&str> for RewriteMap {
    fn from(value: &str) -> Self {
        RewriteMap::Single(value.to_string())
    }
}

/// Per-server or per-call proxy configuration.
///
/// All fields are optional so that a per-call record can be merged over the
/// server record field by field. Defaults are applied at the read accessors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyOptions {
    /// Upstream URL. Required unless `forward` is set.
    pub target: Option<Target>,
    /// Side-channel URL; the request is fired and the response discarded.
    pub forward: Option<Target>,
    /// TLS material for the listener.
    pub ssl: Option<SslConfig>,
    /// Enable upgrade handling on the listener.
    pub ws: Option<bool>,
    /// Add `x-forwarded-{for,port,proto}` headers.
    pub xfwd: Option<bool>,
    /// Verify the upstream TLS certificate (default true).
    pub secure: Option<bool>,
    /// Treat the inbound request target as already absolute.
    pub to_proxy: Option<bool>,
    /// Prepend the target path to the inbound path (default true).
    pub prepend_path: Option<bool>,
    /// Drop the inbound path entirely.
    pub ignore_path: Option<bool>,
    /// Rewrite the outbound `Host` header to the target host.
    pub change_origin: Option<bool>,
    /// Skip the response-copy step; the `proxyRes` hook owns the response.
    pub self_handle_response: Option<bool>,
    /// Register the bundled 502 error responder.
    pub handle_errors: Option<bool>,
    /// Literal `user:pass` emitted as basic `Authorization`.
    pub auth: Option<String>,
    /// Outbound method override.
    pub method: Option<String>,
    /// Headers merged over the inbound headers (overlay wins key by key).
    pub headers: Option<HashMap<String, String>>,
    /// Bind address for the outbound socket.
    pub local_address: Option<IpAddr>,
    /// Connection pool for plain-HTTP upstreams. Absent means a fresh
    /// connection per request with `Connection: close`.
    #[serde(skip)]
    pub http_agent: Option<Agent>,
    /// Connection pool for TLS upstreams.
    #[serde(skip)]
    pub https_agent: Option<Agent>,
    /// Inbound idle limit, milliseconds.
    pub timeout_ms: Option<u64>,
    /// Outbound idle limit, milliseconds.
    pub proxy_timeout_ms: Option<u64>,
    /// Replace the hostname of redirect `Location` headers.
    pub host_rewrite: Option<String>,
    /// Replace redirect `Location` host:port with the inbound `Host`.
    pub auto_rewrite: Option<bool>,
    /// Replace the protocol of redirect `Location` headers.
    pub protocol_rewrite: Option<String>,
    /// `Set-Cookie` `Domain=` rewrite table.
    pub cookie_domain_rewrite: Option<RewriteMap>,
    /// `Set-Cookie` `Path=` rewrite table.
    pub cookie_path_rewrite: Option<RewriteMap>,
}

macro_rules! merge_fields {
    ($dst:expr, $base:expr, [$($field:ident),+ $(,)?]) => {
        $(
            if $dst.$field.is_none() {
                $dst.$field = $base.$field.clone();
            }
        )+
    };
}

impl ProxyOptions {
    /// Shallow-merge `self` over `base`: fields set on `self` win.
    pub fn merged_over(mut self, base: &ProxyOptions) -> ProxyOptions {
        merge_fields!(
            self,
            base,
            [
                target,
                forward,
                ssl,
                ws,
                xfwd,
                secure,
                to_proxy,
                prepend_path,
                ignore_path,
                change_origin,
                self_handle_response,
                handle_errors,
                auth,
                method,
                headers,
                local_address,
                http_agent,
                https_agent,
                timeout_ms,
                proxy_timeout_ms,
                host_rewrite,
                auto_rewrite,
                protocol_rewrite,
                cookie_domain_rewrite,
                cookie_path_rewrite,
            ]
        );
        self
    }

    /// Resolve `target` and `forward` URL strings in place.
    ///
    /// Fails with `MissingTarget` when neither is configured.
    pub fn resolve_targets(&mut self) -> Result<(), ProxyError> {
        if let Some(target) = &self.target {
            self.target = Some(Target::Resolved(target.resolve()?));
        }
        if let Some(forward) = &self.forward {
            self.forward = Some(Target::Resolved(forward.resolve()?));
        }
        if self.target.is_none() && self.forward.is_none() {
            return Err(ProxyError::MissingTarget);
        }
        Ok(())
    }

    /// The resolved target record, if `resolve_targets` has run.
    pub fn resolved_target(&self) -> Option<&ResolvedTarget> {
        self.target.as_ref().and_then(Target::as_resolved)
    }

    /// The resolved forward record, if `resolve_targets` has run.
    pub fn resolved_forward(&self) -> Option<&ResolvedTarget> {
        self.forward.as_ref().and_then(Target::as_resolved)
    }

    pub fn ws_enabled(&self) -> bool {
        self.ws.unwrap_or(false)
    }

    pub fn xfwd_enabled(&self) -> bool {
        self.xfwd.unwrap_or(false)
    }

    pub fn secure_enabled(&self) -> bool {
        self.secure.unwrap_or(true)
    }

    pub fn to_proxy_enabled(&self) -> bool {
        self.to_proxy.unwrap_or(false)
    }

    pub fn prepend_path_enabled(&self) -> bool {
        self.prepend_path.unwrap_or(true)
    }

    pub fn ignore_path_enabled(&self) -> bool {
        self.ignore_path.unwrap_or(false)
    }

    pub fn change_origin_enabled(&self) -> bool {
        self.change_origin.unwrap_or(false)
    }

    pub fn self_handle_response_enabled(&self) -> bool {
        self.self_handle_response.unwrap_or(false)
    }

    pub fn handle_errors_enabled(&self) -> bool {
        self.handle_errors.unwrap_or(false)
    }

    pub fn auto_rewrite_enabled(&self) -> bool {
        self.auto_rewrite.unwrap_or(false)
    }

    pub fn inbound_timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn outbound_timeout(&self) -> Option<Duration> {
        self.proxy_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_call_options_win() {
        let server = ProxyOptions {
            target: Some("http://a:1".into()),
            xfwd: Some(true),
            secure: Some(false),
            ..Default::default()
        };
        let call = ProxyOptions {
            target: Some("http://b:2".into()),
            ..Default::default()
        };
        let merged = call.merged_over(&server);
        match merged.target {
            Some(Target::Url(ref url)) => assert_eq!(url, "http://b:2"),
            other => panic!("unexpected target: {other:?}"),
        }
        assert!(merged.xfwd_enabled());
        assert!(!merged.secure_enabled());
    }

    #[test]
    fn test_resolve_targets_requires_a_destination() {
        let mut options = ProxyOptions::default();
        assert!(matches!(
            options.resolve_targets(),
            Err(ProxyError::MissingTarget)
        ));

        let mut options = ProxyOptions {
            forward: Some("http://log:7000".into()),
            ..Default::default()
        };
        options.resolve_targets().unwrap();
        assert_eq!(options.resolved_forward().unwrap().port, 7000);
        assert!(options.resolved_target().is_none());
    }

    #[test]
    fn test_defaults() {
        let options = ProxyOptions::default();
        assert!(options.secure_enabled());
        assert!(options.prepend_path_enabled());
        assert!(!options.ignore_path_enabled());
        assert!(!options.change_origin_enabled());
        assert!(!options.ws_enabled());
    }

    #[test]
    fn test_rewrite_map_lookup() {
        let map: RewriteMap = "example.com".into();
        assert_eq!(map.replacement_for("internal"), Some("example.com"));

        let mut table = HashMap::new();
        table.insert("old.example".to_string(), "new.example".to_string());
        table.insert("*".to_string(), String::new());
        let map = RewriteMap::Map(table);
        assert_eq!(map.replacement_for("old.example"), Some("new.example"));
        assert_eq!(map.replacement_for("other"), Some(""));

        let map = RewriteMap::Map(HashMap::new());
        assert_eq!(map.replacement_for("anything"), None);
    }
}
