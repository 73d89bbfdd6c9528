//! Outbound transports.
//!
//! Two ways out: the pooled hyper client (an [`Agent`], shared and reused)
//! and an unpooled one-shot client for agentless requests, which ride on
//! `Connection: close`. Upgrade traffic bypasses the pooled client entirely
//! and dials a raw HTTP/1.1 connection that can be spliced afterwards.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hyper::client::conn::http1;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::body::ProxyBody;
use crate::error::{source_io_kind, ProxyError};
use crate::net::RawStream;
use crate::outgoing::OutgoingRequest;
use crate::target::TargetTls;
use crate::tls;

/// The pooled HTTP/1.1 client used for proxying plain requests.
pub type HttpClient =
    Client<hyper_rustls::HttpsConnector<HttpConnector>, ProxyBody>;

/// Connection-pool settings for an [`Agent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub connect_timeout_secs: u64,
    /// Verify upstream certificates for TLS connections through this agent.
    pub secure: bool,
    /// Bind address for outbound sockets.
    pub local_address: Option<IpAddr>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 100,
            idle_timeout_secs: 90,
            keepalive_secs: 60,
            connect_timeout_secs: 5,
            secure: true,
            local_address: None,
        }
    }
}

/// A connection-pool handle for outbound requests.
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct Agent {
    client: HttpClient,
}

impl Agent {
    /// Build an agent with the given pool settings.
    pub fn new(config: AgentConfig) -> Result<Self, ProxyError> {
        let client = build_client(&config, None, true)?;
        Ok(Self { client })
    }

    pub(crate) fn client(&self) -> &HttpClient {
        &self.client
    }
}

impl Default for Agent {
    fn default() -> Self {
        // Default settings cannot fail: no TLS material is loaded from disk.
        Agent::new(AgentConfig::default()).expect("default agent config is infallible")
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent").finish_non_exhaustive()
    }
}

/// Build a hyper client over an HTTPS-capable connector.
fn build_client(
    config: &AgentConfig,
    tls_material: Option<&TargetTls>,
    pooled: bool,
) -> Result<HttpClient, ProxyError> {
    let mut http_connector = HttpConnector::new();
    http_connector.set_keepalive(Some(Duration::from_secs(config.keepalive_secs)));
    http_connector.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));
    http_connector.set_local_address(config.local_address);
    http_connector.enforce_http(false);

    let tls_config = tls::client_config(config.secure, tls_material)?;
    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

    let mut builder = Client::builder(TokioExecutor::new());
    if pooled {
        builder
            .pool_idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_per_host);
    } else {
        builder.pool_max_idle_per_host(0);
    }
    Ok(builder.build(https_connector))
}

/// Resolve the transport for an outgoing request: the configured agent, or a
/// fresh unpooled client honoring the request's TLS and bind settings.
pub(crate) fn transport_for(out: &OutgoingRequest) -> Result<HttpClient, ProxyError> {
    if let Some(agent) = &out.agent {
        return Ok(agent.client().clone());
    }
    let config = AgentConfig {
        secure: out.secure,
        local_address: out.local_address,
        ..Default::default()
    };
    build_client(&config, out.tls.as_ref(), false)
}

/// Classify a pooled-client failure into the proxy error taxonomy.
pub(crate) fn classify_client_error(err: hyper_util::client::legacy::Error) -> ProxyError {
    if source_io_kind(&err, std::io::ErrorKind::ConnectionReset) {
        ProxyError::UpstreamReset(Box::new(err))
    } else if err.is_connect() {
        ProxyError::UpstreamConnect(Box::new(err))
    } else {
        ProxyError::Upstream(Box::new(err))
    }
}

async fn dial(addr: SocketAddr, local_address: Option<IpAddr>) -> std::io::Result<TcpStream> {
    match local_address {
        Some(ip) => {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.bind(SocketAddr::new(ip, 0))?;
            socket.connect(addr).await
        }
        None => TcpStream::connect(addr).await,
    }
}

/// Dial the upstream for an upgrade exchange, wrapping in TLS when the
/// target scheme requires it.
pub(crate) async fn connect_upstream(
    out: &OutgoingRequest,
) -> Result<Box<dyn RawStream>, ProxyError> {
    let addrs = tokio::net::lookup_host((out.host.as_str(), out.port))
        .await
        .map_err(|e| ProxyError::UpstreamConnect(Box::new(e)))?;

    let mut last_err: Option<std::io::Error> = None;
    let mut stream = None;
    for addr in addrs {
        match dial(addr, out.local_address).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let stream = match stream {
        Some(s) => s,
        None => {
            let err = last_err.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
            });
            return Err(ProxyError::UpstreamConnect(Box::new(err)));
        }
    };

    if out.is_secure() {
        let config = tls::client_config(out.secure, out.tls.as_ref())?;
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(out.host.clone())
            .map_err(|e| ProxyError::Tls(format!("invalid server name '{}': {e}", out.host)))?;
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ProxyError::UpstreamConnect(Box::new(e)))?;
        Ok(Box::new(tls_stream))
    } else {
        Ok(Box::new(stream))
    }
}

/// Perform an HTTP/1.1 client handshake on a raw connection and drive the
/// connection task in the background, upgrades enabled.
pub(crate) async fn http1_handshake(
    io: Box<dyn RawStream>,
) -> Result<http1::SendRequest<ProxyBody>, ProxyError> {
    let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            debug!(error = %err, "upstream connection task ended");
        }
    });
    Ok(sender)
}
