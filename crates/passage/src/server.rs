//! The server facade.
//!
//! Owns the two pass lists, the hook table and (optionally) a listening
//! socket. `web` and `ws` are the dispatch entry points; `all` takes a raw
//! accepted connection and routes it by sniffing the first request head.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::http::request;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::body::{self, ProxyBody};
use crate::error::ProxyError;
use crate::events::{ErrorCallback, Hooks};
use crate::net::{self, RawStream, Rewind, TcpStreamRef};
use crate::options::ProxyOptions;
use crate::passes::{
    self, default_web_passes, default_ws_passes, PassKind, PassList, PeerInfo, WebContext,
    WebPass, WsContext, WsPass,
};
use crate::tls;

/// A stage to insert through `before`/`after`. The variant must match the
/// addressed pass list.
pub enum PassStage {
    Web(WebPass),
    Ws(WsPass),
}

impl From<WebPass> for PassStage {
    fn from(pass: WebPass) -> Self {
        PassStage::Web(pass)
    }
}

impl From<WsPass> for PassStage {
    fn from(pass: WsPass) -> Self {
        PassStage::Ws(pass)
    }
}

/// Arguments for a plain-HTTP dispatch.
pub struct WebArgs {
    pub req: Request<ProxyBody>,
    pub peer: PeerInfo,
    /// Per-call options, merged over the server options.
    pub options: Option<ProxyOptions>,
    /// Receives I/O errors instead of the server `error` hook.
    pub error_cb: Option<ErrorCallback>,
}

/// Arguments for an upgrade dispatch: the request head, the hijacked client
/// transport and any bytes read past the head boundary.
pub struct WsArgs {
    pub req: Request<()>,
    pub socket: Box<dyn RawStream>,
    pub head: Bytes,
    pub peer: PeerInfo,
    pub options: Option<ProxyOptions>,
    pub error_cb: Option<ErrorCallback>,
}

/// The programmable reverse proxy server.
pub struct ProxyServer {
    options: ProxyOptions,
    web_passes: RwLock<PassList<WebPass>>,
    ws_passes: RwLock<PassList<WsPass>>,
    hooks: Arc<Hooks>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    /// Create a server from its base options. Listener TLS material, when
    /// configured, is loaded and validated here.
    pub fn new(options: ProxyOptions) -> Result<Self, ProxyError> {
        let tls_acceptor = match &options.ssl {
            Some(ssl) => Some(tls::create_tls_acceptor(&ssl.cert_path, &ssl.key_path)?),
            None => None,
        };
        Ok(Self {
            options,
            web_passes: RwLock::new(default_web_passes()),
            ws_passes: RwLock::new(default_ws_passes()),
            hooks: Arc::new(Hooks::new()),
            tls_acceptor,
        })
    }

    /// The server's hook table.
    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    pub fn on_error(&self, handler: impl Fn(&ProxyError) + Send + Sync + 'static) {
        self.hooks.on_error(handler);
    }

    pub fn on_econnreset(&self, handler: impl Fn(&ProxyError) + Send + Sync + 'static) {
        self.hooks.on_econnreset(handler);
    }

    pub fn on_proxy_req(
        &self,
        handler: impl Fn(&mut Request<ProxyBody>, &request::Parts, &ProxyOptions)
            + Send
            + Sync
            + 'static,
    ) {
        self.hooks.on_proxy_req(handler);
    }

    pub fn on_proxy_req_ws(
        &self,
        handler: impl Fn(&mut Request<ProxyBody>, &request::Parts, &ProxyOptions)
            + Send
            + Sync
            + 'static,
    ) {
        self.hooks.on_proxy_req_ws(handler);
    }

    pub fn on_proxy_res(
        &self,
        handler: impl Fn(&mut Response<ProxyBody>, &request::Parts) + Send + Sync + 'static,
    ) {
        self.hooks.on_proxy_res(handler);
    }

    pub fn on_start(&self, handler: impl Fn(&request::Parts) + Send + Sync + 'static) {
        self.hooks.on_start(handler);
    }

    pub fn on_open(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.hooks.on_open(handler);
    }

    pub fn on_close(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.hooks.on_close(handler);
    }

    pub fn on_end(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.hooks.on_end(handler);
    }

    /// Insert a stage immediately before the pass named `anchor`.
    ///
    /// Intended for setup time; mutating pass lists during concurrent
    /// dispatch affects only requests accepted afterwards.
    pub fn before(
        &self,
        kind: PassKind,
        anchor: &str,
        stage: impl Into<PassStage>,
    ) -> Result<(), ProxyError> {
        match (kind, stage.into()) {
            (PassKind::Web, PassStage::Web(pass)) => {
                self.web_passes.write().insert_before(anchor, pass)
            }
            (PassKind::Ws, PassStage::Ws(pass)) => {
                self.ws_passes.write().insert_before(anchor, pass)
            }
            (kind, _) => Err(ProxyError::InvalidKind(format!(
                "stage does not belong to the '{kind}' pass list"
            ))),
        }
    }

    /// Insert a stage immediately after the pass named `anchor`.
    pub fn after(
        &self,
        kind: PassKind,
        anchor: &str,
        stage: impl Into<PassStage>,
    ) -> Result<(), ProxyError> {
        match (kind, stage.into()) {
            (PassKind::Web, PassStage::Web(pass)) => {
                self.web_passes.write().insert_after(anchor, pass)
            }
            (PassKind::Ws, PassStage::Ws(pass)) => {
                self.ws_passes.write().insert_after(anchor, pass)
            }
            (kind, _) => Err(ProxyError::InvalidKind(format!(
                "stage does not belong to the '{kind}' pass list"
            ))),
        }
    }

    /// Names of the passes in a list, in dispatch order.
    pub fn pass_names(&self, kind: PassKind) -> Vec<String> {
        match kind {
            PassKind::Web => self
                .web_passes
                .read()
                .names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            PassKind::Ws => self
                .ws_passes
                .read()
                .names()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    /// Proxy a plain HTTP request and return the response for the client.
    pub async fn web(&self, args: WebArgs) -> Result<Response<ProxyBody>, ProxyError> {
        let WebArgs {
            req,
            peer,
            options,
            error_cb,
        } = args;
        let mut effective = options.unwrap_or_default().merged_over(&self.options);
        if let Err(err) = effective.resolve_targets() {
            self.hooks.emit_error(&err);
            return Err(err);
        }
        let handle_errors = effective.handle_errors_enabled();

        let snapshot = self.web_passes.read().snapshot();
        let ctx = WebContext {
            req,
            peer,
            options: effective,
            hooks: self.hooks.clone(),
            error_cb: error_cb.clone(),
        };
        match passes::run_web(snapshot, ctx).await {
            Ok(response) => Ok(response),
            Err(err) => {
                if err.is_reset() {
                    self.hooks.emit_econnreset(&err);
                } else if let Some(cb) = &error_cb {
                    cb(&err);
                } else {
                    self.hooks.emit_error(&err);
                }
                if handle_errors && !err.is_reset() {
                    return Ok(bad_gateway());
                }
                Err(err)
            }
        }
    }

    /// Proxy a WebSocket upgrade over a hijacked client transport.
    pub async fn ws(&self, args: WsArgs) -> Result<(), ProxyError> {
        let WsArgs {
            req,
            socket,
            head,
            peer,
            options,
            error_cb,
        } = args;
        let mut effective = options.unwrap_or_default().merged_over(&self.options);
        if let Err(err) = effective.resolve_targets() {
            self.hooks.emit_error(&err);
            return Err(err);
        }

        let snapshot = self.ws_passes.read().snapshot();
        let ctx = WsContext {
            req,
            io: socket,
            head,
            peer,
            options: effective,
            hooks: self.hooks.clone(),
            error_cb: error_cb.clone(),
        };
        match passes::run_ws(snapshot, ctx).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(cb) = &error_cb {
                    cb(&err);
                } else {
                    self.hooks.emit_error(&err);
                }
                Err(err)
            }
        }
    }

    /// Handle one accepted connection: sniff the first request head, route
    /// `Upgrade: websocket` to the ws pipeline (when enabled), serve
    /// everything else as plain HTTP.
    pub async fn all(
        self: &Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> Result<(), ProxyError> {
        match self.tls_acceptor.clone() {
            Some(acceptor) => {
                let tls_stream = acceptor.accept(stream).await.map_err(ProxyError::Io)?;
                self.dispatch_connection(tls_stream, remote, true).await
            }
            None => self.dispatch_connection(stream, remote, false).await,
        }
    }

    async fn dispatch_connection<S>(
        self: &Arc<Self>,
        mut stream: S,
        remote: SocketAddr,
        encrypted: bool,
    ) -> Result<(), ProxyError>
    where
        S: RawStream + TcpStreamRef + 'static,
    {
        let (buf, head_end) = net::read_request_head(&mut stream).await?;
        let head_req = net::parse_request_head(&buf[..head_end])?;
        let peer = PeerInfo {
            remote_addr: Some(remote),
            encrypted,
        };

        if self.options.ws_enabled() && net::is_websocket_upgrade(&head_req) {
            net::tune_keepalive(stream.tcp_stream());
            let head = Bytes::copy_from_slice(&buf[head_end..]);
            if let Err(err) = self
                .ws(WsArgs {
                    req: head_req,
                    socket: Box::new(stream),
                    head,
                    peer,
                    options: None,
                    error_cb: None,
                })
                .await
            {
                debug!(error = %err, "websocket dispatch failed");
            }
            return Ok(());
        }

        // Replay the buffered bytes and let hyper drive the connection.
        let io = TokioIo::new(Rewind::new(Bytes::from(buf), stream));
        let server = Arc::clone(self);
        let service = service_fn(move |req: Request<Incoming>| {
            let server = Arc::clone(&server);
            async move {
                let result = server
                    .web(WebArgs {
                        req: req.map(body::from_incoming),
                        peer,
                        options: None,
                        error_cb: None,
                    })
                    .await;
                match result {
                    Ok(response) => Ok::<_, Infallible>(response),
                    Err(err) => {
                        debug!(error = %err, "proxying failed; answering 502");
                        Ok(bad_gateway())
                    }
                }
            }
        });
        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
            debug!(error = %err, "error serving connection from {remote}");
        }
        Ok(())
    }

    /// Bind a listener and serve until [`Listening::close`] is called.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<Listening, ProxyError> {
        let listener = net::create_listener(addr)?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, ws = self.options.ws_enabled(), "proxy listening");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(err) = server.all(stream, remote).await {
                                    debug!(error = %err, "connection ended with error");
                                }
                            });
                        }
                        Err(err) => {
                            error!(error = %err, "accept failed");
                        }
                    },
                }
            }
            debug!("listener loop stopped");
        });

        Ok(Listening {
            local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle to a bound listener.
pub struct Listening {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Listening {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for the accept loop to finish.
    /// In-flight connections are not torn down.
    pub async fn close(self) -> Result<(), ProxyError> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| ProxyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }
}

/// The bundled error response: what the default responder writes when
/// `handle_errors` is enabled.
pub(crate) fn bad_gateway() -> Response<ProxyBody> {
    let mut response = Response::new(body::full("502 Bad Gateway"));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("text/plain"));
    response
}
