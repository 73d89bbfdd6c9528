//! The proxy pipeline: ordered, named transformation stages.
//!
//! Two pass lists exist per server, one for plain HTTP and one for WebSocket
//! upgrades. Dispatch walks the list in order; a pass either hands the
//! context to the next stage or terminates the pipeline with a result. The
//! `stream` pass is always the terminal stage of its list.
//!
//! # Module structure
//!
//! - `web` - the HTTP passes (`delete_length`, `timeout`, `x_headers`, `stream`)
//! - `ws` - the upgrade passes (`check_method_and_header`, `x_headers`, `stream`)
//! - `rewrite` - redirect-Location and Set-Cookie rewriting helpers

pub mod rewrite;
pub mod web;
pub mod ws;

use std::borrow::Cow;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use hyper::{Request, Response};

use crate::body::ProxyBody;
use crate::error::ProxyError;
use crate::events::{ErrorCallback, Hooks};
use crate::net::RawStream;
use crate::options::ProxyOptions;

/// Which pass list an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Web,
    Ws,
}

impl FromStr for PassKind {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(PassKind::Web),
            "ws" => Ok(PassKind::Ws),
            other => Err(ProxyError::InvalidKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for PassKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PassKind::Web => f.write_str("web"),
            PassKind::Ws => f.write_str("ws"),
        }
    }
}

/// Connection facts about the inbound client, consumed by the `x_headers`
/// passes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeerInfo {
    pub remote_addr: Option<SocketAddr>,
    /// Whether the client connection arrived over TLS.
    pub encrypted: bool,
}

/// Pipeline state for a plain-HTTP dispatch. Each pass owns the context and
/// either passes it on or terminates with a response.
pub struct WebContext {
    pub req: Request<ProxyBody>,
    pub peer: PeerInfo,
    pub options: ProxyOptions,
    pub(crate) hooks: Arc<Hooks>,
    pub(crate) error_cb: Option<ErrorCallback>,
}

/// Outcome of a web pass.
pub enum WebFlow {
    /// Hand the context to the next pass.
    Continue(WebContext),
    /// Terminate the pipeline with this response.
    Done(Response<ProxyBody>),
}

/// Pipeline state for an upgrade dispatch: the raw client stream plus any
/// bytes read past the request head.
pub struct WsContext {
    pub req: Request<()>,
    pub io: Box<dyn RawStream>,
    pub head: Bytes,
    pub peer: PeerInfo,
    pub options: ProxyOptions,
    pub(crate) hooks: Arc<Hooks>,
    pub(crate) error_cb: Option<ErrorCallback>,
}

/// Outcome of a ws pass.
pub enum WsFlow {
    Continue(WsContext),
    /// The socket has been consumed (spliced, answered or destroyed).
    Done,
}

pub type WebPassFuture = Pin<Box<dyn Future<Output = Result<WebFlow, ProxyError>> + Send>>;
pub type WsPassFuture = Pin<Box<dyn Future<Output = Result<WsFlow, ProxyError>> + Send>>;

type WebPassFn = Arc<dyn Fn(WebContext) -> WebPassFuture + Send + Sync>;
type WsPassFn = Arc<dyn Fn(WsContext) -> WsPassFuture + Send + Sync>;

/// A named stage of the web pipeline.
#[derive(Clone)]
pub struct WebPass {
    name: Cow<'static, str>,
    run: WebPassFn,
}

impl WebPass {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        run: impl Fn(WebContext) -> WebPassFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            run: Arc::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(&self, ctx: WebContext) -> WebPassFuture {
        (self.run)(ctx)
    }
}

/// A named stage of the ws pipeline.
#[derive(Clone)]
pub struct WsPass {
    name: Cow<'static, str>,
    run: WsPassFn,
}

impl WsPass {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        run: impl Fn(WsContext) -> WsPassFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            run: Arc::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(&self, ctx: WsContext) -> WsPassFuture {
        (self.run)(ctx)
    }
}

/// Identity of a pass within a list.
pub trait NamedPass {
    fn pass_name(&self) -> &str;
}

impl NamedPass for WebPass {
    fn pass_name(&self) -> &str {
        self.name()
    }
}

impl NamedPass for WsPass {
    fn pass_name(&self) -> &str {
        self.name()
    }
}

/// Ordered sequence of passes with unique names.
#[derive(Clone)]
pub struct PassList<P> {
    passes: Vec<P>,
}

impl<P: NamedPass> PassList<P> {
    pub(crate) fn new(passes: Vec<P>) -> Self {
        Self { passes }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.passes.iter().position(|p| p.pass_name() == name)
    }

    fn check_unique(&self, pass: &P) -> Result<(), ProxyError> {
        if self.position(pass.pass_name()).is_some() {
            return Err(ProxyError::DuplicatePass(pass.pass_name().to_string()));
        }
        Ok(())
    }

    /// Insert `pass` immediately before the pass named `anchor`.
    pub fn insert_before(&mut self, anchor: &str, pass: P) -> Result<(), ProxyError> {
        self.check_unique(&pass)?;
        let index = self
            .position(anchor)
            .ok_or_else(|| ProxyError::NoSuchPass(anchor.to_string()))?;
        self.passes.insert(index, pass);
        Ok(())
    }

    /// Insert `pass` immediately after the pass named `anchor`.
    pub fn insert_after(&mut self, anchor: &str, pass: P) -> Result<(), ProxyError> {
        self.check_unique(&pass)?;
        let index = self
            .position(anchor)
            .ok_or_else(|| ProxyError::NoSuchPass(anchor.to_string()))?;
        self.passes.insert(index + 1, pass);
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.pass_name()).collect()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

impl<P: Clone> PassList<P> {
    /// Snapshot the list for a dispatch; mutation during dispatch does not
    /// affect in-flight requests.
    pub(crate) fn snapshot(&self) -> Vec<P> {
        self.passes.clone()
    }
}

/// The fixed web pass list: `delete_length`, `timeout`, `x_headers`,
/// `stream`.
pub(crate) fn default_web_passes() -> PassList<WebPass> {
    PassList::new(vec![
        WebPass::new("delete_length", |ctx| Box::pin(web::delete_length(ctx))),
        WebPass::new("timeout", |ctx| Box::pin(web::timeout(ctx))),
        WebPass::new("x_headers", |ctx| Box::pin(web::x_headers(ctx))),
        WebPass::new("stream", |ctx| Box::pin(web::stream(ctx))),
    ])
}

/// The fixed ws pass list: `check_method_and_header`, `x_headers`,
/// `stream`.
pub(crate) fn default_ws_passes() -> PassList<WsPass> {
    PassList::new(vec![
        WsPass::new("check_method_and_header", |ctx| {
            Box::pin(ws::check_method_and_header(ctx))
        }),
        WsPass::new("x_headers", |ctx| Box::pin(ws::x_headers(ctx))),
        WsPass::new("stream", |ctx| Box::pin(ws::stream(ctx))),
    ])
}

/// Walk the web passes in order until one terminates the pipeline.
pub(crate) async fn run_web(
    passes: Vec<WebPass>,
    mut ctx: WebContext,
) -> Result<Response<ProxyBody>, ProxyError> {
    for pass in passes {
        match pass.invoke(ctx).await? {
            WebFlow::Continue(next) => ctx = next,
            WebFlow::Done(response) => return Ok(response),
        }
    }
    Err(ProxyError::PipelineExhausted)
}

/// Walk the ws passes in order until one terminates the pipeline.
pub(crate) async fn run_ws(passes: Vec<WsPass>, mut ctx: WsContext) -> Result<(), ProxyError> {
    for pass in passes {
        match pass.invoke(ctx).await? {
            WsFlow::Continue(next) => ctx = next,
            WsFlow::Done => return Ok(()),
        }
    }
    Err(ProxyError::PipelineExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn web_ctx() -> WebContext {
        WebContext {
            req: Request::builder()
                .uri("/")
                .body(body::empty())
                .unwrap(),
            peer: PeerInfo::default(),
            options: ProxyOptions::default(),
            hooks: Arc::new(Hooks::new()),
            error_cb: None,
        }
    }

    fn marker_pass(name: &'static str, log: Arc<parking_lot::Mutex<Vec<&'static str>>>) -> WebPass {
        WebPass::new(name, move |ctx| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().push(name);
                Ok(WebFlow::Continue(ctx))
            })
        })
    }

    fn halting_pass(name: &'static str) -> WebPass {
        WebPass::new(name, |_ctx| {
            Box::pin(async move {
                Ok(WebFlow::Done(
                    Response::builder().status(204).body(body::empty()).unwrap(),
                ))
            })
        })
    }

    #[test]
    fn test_pass_kind_parsing() {
        assert_eq!(PassKind::from_str("web").unwrap(), PassKind::Web);
        assert_eq!(PassKind::from_str("ws").unwrap(), PassKind::Ws);
        assert!(matches!(
            PassKind::from_str("tcp"),
            Err(ProxyError::InvalidKind(_))
        ));
    }

    #[test]
    fn test_default_lists_have_fixed_order() {
        assert_eq!(
            default_web_passes().names(),
            vec!["delete_length", "timeout", "x_headers", "stream"]
        );
        assert_eq!(
            default_ws_passes().names(),
            vec!["check_method_and_header", "x_headers", "stream"]
        );
    }

    #[test]
    fn test_insert_before_anchors_correctly() {
        let mut list = default_web_passes();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        list.insert_before("stream", marker_pass("custom", log))
            .unwrap();
        assert_eq!(
            list.names(),
            vec!["delete_length", "timeout", "x_headers", "custom", "stream"]
        );
    }

    #[test]
    fn test_insert_after_uses_anchor_plus_one() {
        let mut list = default_web_passes();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        list.insert_after("delete_length", marker_pass("custom", log))
            .unwrap();
        assert_eq!(
            list.names(),
            vec!["delete_length", "custom", "timeout", "x_headers", "stream"]
        );
    }

    #[test]
    fn test_insert_unknown_anchor_fails() {
        let mut list = default_web_passes();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let err = list
            .insert_before("nope", marker_pass("custom", log))
            .unwrap_err();
        assert!(matches!(err, ProxyError::NoSuchPass(name) if name == "nope"));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let mut list = default_web_passes();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let err = list
            .insert_before("stream", marker_pass("timeout", log))
            .unwrap_err();
        assert!(matches!(err, ProxyError::DuplicatePass(_)));
    }

    #[tokio::test]
    async fn test_pipeline_short_circuits() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let after_halt_ran = Arc::new(AtomicUsize::new(0));
        let counter = after_halt_ran.clone();
        let passes = vec![
            marker_pass("a", log.clone()),
            halting_pass("b"),
            WebPass::new("c", move |ctx| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(WebFlow::Continue(ctx))
                })
            }),
        ];
        let response = run_web(passes, web_ctx()).await.unwrap();
        assert_eq!(response.status(), 204);
        assert_eq!(*log.lock(), vec!["a"]);
        assert_eq!(after_halt_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhausted_pipeline_is_an_error() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let passes = vec![marker_pass("only", log)];
        let err = run_web(passes, web_ctx()).await.unwrap_err();
        assert!(matches!(err, ProxyError::PipelineExhausted));
    }
}
