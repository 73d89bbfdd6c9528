//! Error taxonomy for the proxy pipeline.
//!
//! Setup mistakes (bad pass-list kind, unknown anchor, unparseable target)
//! surface synchronously as `Err` values. I/O failures are classified here
//! and delivered through the event channel or a per-call error callback.

use std::time::Duration;

use thiserror::Error;

/// Boxed error type used for body streams and wrapped I/O failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// All errors produced by the proxy core.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Neither `target` nor `forward` was configured for a dispatch.
    #[error("must provide a proper target or forward URL")]
    MissingTarget,

    /// A pass-list kind string was not `web` or `ws`.
    #[error("invalid pass list kind: {0}")]
    InvalidKind(String),

    /// `before`/`after` named an anchor that does not exist.
    #[error("no pass named '{0}'")]
    NoSuchPass(String),

    /// A pass with the same name already exists in the list.
    #[error("a pass named '{0}' already exists")]
    DuplicatePass(String),

    /// The configured target URL could not be parsed.
    #[error("invalid target url '{url}': {reason}")]
    InvalidTarget { url: String, reason: String },

    /// DNS, TCP or TLS failure while reaching the upstream.
    #[error("upstream connect failed: {0}")]
    UpstreamConnect(#[source] BoxError),

    /// The upstream request failed after the connection was established.
    #[error("upstream request failed: {0}")]
    Upstream(#[source] BoxError),

    /// The upstream peer reset the connection mid-stream.
    #[error("upstream connection reset: {0}")]
    UpstreamReset(#[source] BoxError),

    /// The upstream did not answer within `proxy_timeout_ms`.
    #[error("upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),

    /// Failure on the fire-and-forget `forward` side channel.
    #[error("forward request failed: {0}")]
    Forward(#[source] Box<ProxyError>),

    /// The client went away before the exchange completed.
    #[error("client connection closed")]
    ClientGone,

    /// TLS material could not be loaded or assembled.
    #[error("tls setup failed: {0}")]
    Tls(String),

    /// Every pass continued and no terminal pass produced a result.
    #[error("pass list exhausted without a terminal pass")]
    PipelineExhausted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),
}

impl ProxyError {
    /// Stable machine-readable name for the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::MissingTarget => "missing_target",
            ProxyError::InvalidKind(_) => "invalid_kind",
            ProxyError::NoSuchPass(_) => "no_such_pass",
            ProxyError::DuplicatePass(_) => "duplicate_pass",
            ProxyError::InvalidTarget { .. } => "invalid_target",
            ProxyError::UpstreamConnect(_) => "upstream_connect",
            ProxyError::Upstream(_) => "upstream",
            ProxyError::UpstreamReset(_) => "upstream_reset",
            ProxyError::UpstreamTimeout(_) => "upstream_timeout",
            ProxyError::Forward(_) => "forward",
            ProxyError::ClientGone => "client_gone",
            ProxyError::Tls(_) => "tls",
            ProxyError::PipelineExhausted => "pipeline_exhausted",
            ProxyError::Io(_) => "io",
            ProxyError::Http(_) => "http",
            ProxyError::Hyper(_) => "hyper",
        }
    }

    /// True when the error class means the upstream peer reset the stream.
    pub fn is_reset(&self) -> bool {
        matches!(self, ProxyError::UpstreamReset(_))
    }
}

/// Walk an error's source chain looking for a `std::io::Error` of the given kind.
pub(crate) fn source_io_kind(err: &(dyn std::error::Error + 'static), kind: std::io::ErrorKind) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == kind {
                return true;
            }
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(ProxyError::MissingTarget.kind(), "missing_target");
        assert_eq!(ProxyError::InvalidKind("tcp".into()).kind(), "invalid_kind");
        assert_eq!(ProxyError::NoSuchPass("x".into()).kind(), "no_such_pass");
    }

    #[test]
    fn test_source_io_kind_walks_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = ProxyError::UpstreamReset(Box::new(io));
        assert!(source_io_kind(&err, std::io::ErrorKind::ConnectionReset));
        assert!(!source_io_kind(&err, std::io::ErrorKind::TimedOut));
        assert!(err.is_reset());
    }
}
