//! Typed event hooks.
//!
//! The reference design funnels both lifecycle hooks and error propagation
//! through one emitter; here each event has its own typed registry. Passes
//! receive an `Arc<Hooks>` capability instead of the server itself, which
//! keeps the server and the passes decoupled.

use std::sync::Arc;

use hyper::http::request;
use hyper::{Request, Response};
use parking_lot::RwLock;

use crate::body::ProxyBody;
use crate::error::ProxyError;
use crate::options::ProxyOptions;

/// Per-call error callback. When present it receives I/O errors instead of
/// the server's `error` hook.
pub type ErrorCallback = Arc<dyn Fn(&ProxyError) + Send + Sync>;

type ErrorHook = Box<dyn Fn(&ProxyError) + Send + Sync>;
type RequestHook =
    Box<dyn Fn(&mut Request<ProxyBody>, &request::Parts, &ProxyOptions) + Send + Sync>;
type ResponseHook = Box<dyn Fn(&mut Response<ProxyBody>, &request::Parts) + Send + Sync>;
type StartHook = Box<dyn Fn(&request::Parts) + Send + Sync>;
type LifecycleHook = Box<dyn Fn() + Send + Sync>;

/// Registries for every event the core emits.
#[derive(Default)]
pub struct Hooks {
    error: RwLock<Vec<ErrorHook>>,
    econnreset: RwLock<Vec<ErrorHook>>,
    proxy_req: RwLock<Vec<RequestHook>>,
    proxy_req_ws: RwLock<Vec<RequestHook>>,
    proxy_res: RwLock<Vec<ResponseHook>>,
    start: RwLock<Vec<StartHook>>,
    open: RwLock<Vec<LifecycleHook>>,
    close: RwLock<Vec<LifecycleHook>>,
    end: RwLock<Vec<LifecycleHook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_error(&self, handler: impl Fn(&ProxyError) + Send + Sync + 'static) {
        self.error.write().push(Box::new(handler));
    }

    pub fn on_econnreset(&self, handler: impl Fn(&ProxyError) + Send + Sync + 'static) {
        self.econnreset.write().push(Box::new(handler));
    }

    /// Hook fired with the outbound request before its body starts flowing;
    /// the handler may mutate headers.
    pub fn on_proxy_req(
        &self,
        handler: impl Fn(&mut Request<ProxyBody>, &request::Parts, &ProxyOptions)
            + Send
            + Sync
            + 'static,
    ) {
        self.proxy_req.write().push(Box::new(handler));
    }

    pub fn on_proxy_req_ws(
        &self,
        handler: impl Fn(&mut Request<ProxyBody>, &request::Parts, &ProxyOptions)
            + Send
            + Sync
            + 'static,
    ) {
        self.proxy_req_ws.write().push(Box::new(handler));
    }

    /// Hook fired with the upstream response before it is copied back.
    pub fn on_proxy_res(
        &self,
        handler: impl Fn(&mut Response<ProxyBody>, &request::Parts) + Send + Sync + 'static,
    ) {
        self.proxy_res.write().push(Box::new(handler));
    }

    pub fn on_start(&self, handler: impl Fn(&request::Parts) + Send + Sync + 'static) {
        self.start.write().push(Box::new(handler));
    }

    pub fn on_open(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.open.write().push(Box::new(handler));
    }

    pub fn on_close(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.close.write().push(Box::new(handler));
    }

    pub fn on_end(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.end.write().push(Box::new(handler));
    }

    pub fn has_error_listeners(&self) -> bool {
        !self.error.read().is_empty()
    }

    /// Emit `error`; returns whether any listener ran.
    pub(crate) fn emit_error(&self, err: &ProxyError) -> bool {
        let handlers = self.error.read();
        for handler in handlers.iter() {
            handler(err);
        }
        !handlers.is_empty()
    }

    pub(crate) fn emit_econnreset(&self, err: &ProxyError) {
        for handler in self.econnreset.read().iter() {
            handler(err);
        }
    }

    pub(crate) fn emit_proxy_req(
        &self,
        outbound: &mut Request<ProxyBody>,
        inbound: &request::Parts,
        options: &ProxyOptions,
    ) {
        for handler in self.proxy_req.read().iter() {
            handler(outbound, inbound, options);
        }
    }

    pub(crate) fn emit_proxy_req_ws(
        &self,
        outbound: &mut Request<ProxyBody>,
        inbound: &request::Parts,
        options: &ProxyOptions,
    ) {
        for handler in self.proxy_req_ws.read().iter() {
            handler(outbound, inbound, options);
        }
    }

    pub(crate) fn emit_proxy_res(
        &self,
        response: &mut Response<ProxyBody>,
        inbound: &request::Parts,
    ) {
        for handler in self.proxy_res.read().iter() {
            handler(response, inbound);
        }
    }

    pub(crate) fn emit_start(&self, inbound: &request::Parts) {
        for handler in self.start.read().iter() {
            handler(inbound);
        }
    }

    pub(crate) fn emit_open(&self) {
        for handler in self.open.read().iter() {
            handler();
        }
    }

    pub(crate) fn emit_close(&self) {
        for handler in self.close.read().iter() {
            handler();
        }
    }

    pub(crate) fn emit_end(&self) {
        for handler in self.end.read().iter() {
            handler();
        }
    }

    /// Deliver an I/O error from a detached context: the per-call callback
    /// wins, then the `error` hook. With neither attached the error is
    /// unhandled and the emission panics so misconfiguration stays visible.
    pub(crate) fn deliver_error(&self, error_cb: Option<&ErrorCallback>, err: &ProxyError) {
        if let Some(cb) = error_cb {
            cb(err);
            return;
        }
        if !self.emit_error(err) {
            panic!("unhandled proxy error: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_error_listeners_run_in_order() {
        let hooks = Hooks::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        hooks.on_error(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        hooks.on_error(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        });
        assert!(hooks.emit_error(&ProxyError::MissingTarget));
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_emit_error_without_listeners_reports_unhandled() {
        let hooks = Hooks::new();
        assert!(!hooks.emit_error(&ProxyError::MissingTarget));
    }

    #[test]
    fn test_error_callback_shadows_error_hook() {
        let hooks = Hooks::new();
        let hook_ran = Arc::new(AtomicUsize::new(0));
        let hook_count = hook_ran.clone();
        hooks.on_error(move |_| {
            hook_count.fetch_add(1, Ordering::SeqCst);
        });

        let cb_ran = Arc::new(AtomicUsize::new(0));
        let cb_count = cb_ran.clone();
        let cb: ErrorCallback = Arc::new(move |_| {
            cb_count.fetch_add(1, Ordering::SeqCst);
        });

        hooks.deliver_error(Some(&cb), &ProxyError::MissingTarget);
        assert_eq!(cb_ran.load(Ordering::SeqCst), 1);
        assert_eq!(hook_ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[should_panic(expected = "unhandled proxy error")]
    fn test_unhandled_error_panics() {
        let hooks = Hooks::new();
        hooks.deliver_error(None, &ProxyError::MissingTarget);
    }
}
