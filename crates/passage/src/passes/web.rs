//! The plain-HTTP passes.
//!
//! Order is fixed: `delete_length`, `timeout`, `x_headers`, then the
//! terminal `stream` pass where upstream I/O happens.

use http_body_util::combinators::BoxBody;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, EXPECT, HOST, TRANSFER_ENCODING};
use hyper::{HeaderMap, Method, Response, StatusCode};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::rewrite;
use super::{PeerInfo, WebContext, WebFlow};
use crate::body::{self, IdleTimeoutBody, TapBody};
use crate::client;
use crate::error::ProxyError;
use crate::outgoing::{build_outgoing, Which};

pub static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub static X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
pub static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Captures the `:port` suffix of a `Host` header.
static HOST_PORT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":(\d+)").unwrap());

/// Upstreams commonly reject chunked framing on bodyless DELETE/OPTIONS;
/// pin the length to zero when the client sent none.
pub(crate) async fn delete_length(mut ctx: WebContext) -> Result<WebFlow, ProxyError> {
    let method = ctx.req.method().clone();
    if (method == Method::DELETE || method == Method::OPTIONS)
        && !ctx.req.headers().contains_key(CONTENT_LENGTH)
    {
        let headers = ctx.req.headers_mut();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        headers.remove(TRANSFER_ENCODING);
    }
    Ok(WebFlow::Continue(ctx))
}

/// Apply the inbound idle limit to the request body.
pub(crate) async fn timeout(mut ctx: WebContext) -> Result<WebFlow, ProxyError> {
    if let Some(idle) = ctx.options.inbound_timeout() {
        let (parts, inbound_body) = ctx.req.into_parts();
        let wrapped = BoxBody::new(IdleTimeoutBody::new(inbound_body, idle));
        ctx.req = hyper::Request::from_parts(parts, wrapped);
    }
    Ok(WebFlow::Continue(ctx))
}

/// Client-side port for the `x-forwarded-port` header: the `Host` header's
/// explicit port, else the default for the connection's security.
pub(crate) fn forwarded_port(headers: &HeaderMap, encrypted: bool) -> String {
    if let Some(host) = headers.get(HOST).and_then(|v| v.to_str().ok()) {
        if let Some(caps) = HOST_PORT_RE.captures(host) {
            return caps[1].to_string();
        }
    }
    if encrypted { "443" } else { "80" }.to_string()
}

fn append_header(headers: &mut HeaderMap, name: &HeaderName, value: &str) {
    let combined = match headers.get(name).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing},{value}"),
        _ => value.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(name.clone(), value);
    }
}

/// Append the `x-forwarded-{for,port,proto}` triple, comma-separating with
/// any values already present.
pub(crate) fn append_xfwd(headers: &mut HeaderMap, peer: &PeerInfo, proto: &str) {
    let for_value = peer
        .remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default();
    let port_value = forwarded_port(headers, peer.encrypted);
    append_header(headers, &X_FORWARDED_FOR, &for_value);
    append_header(headers, &X_FORWARDED_PORT, &port_value);
    append_header(headers, &X_FORWARDED_PROTO, proto);
}

pub(crate) async fn x_headers(mut ctx: WebContext) -> Result<WebFlow, ProxyError> {
    if ctx.options.xfwd_enabled() {
        let peer = ctx.peer;
        let proto = if peer.encrypted { "https" } else { "http" };
        append_xfwd(ctx.req.headers_mut(), &peer, proto);
    }
    Ok(WebFlow::Continue(ctx))
}

/// The terminal pass: fire the `forward` side channel if configured, issue
/// the target request, and map the upstream response back to the client.
pub(crate) async fn stream(ctx: WebContext) -> Result<WebFlow, ProxyError> {
    let WebContext {
        req,
        peer: _,
        options,
        hooks,
        error_cb,
    } = ctx;
    let (parts, inbound_body) = req.into_parts();
    let mut inbound_body = Some(inbound_body);
    hooks.emit_start(&parts);

    if options.resolved_forward().is_some() {
        let out = build_outgoing(&options, &parts, Which::Forward)?;
        let transport = client::transport_for(&out)?;
        // The inbound body goes to the side channel only when there is no
        // primary target to receive it.
        let forward_body = if options.resolved_target().is_none() {
            inbound_body.take().unwrap_or_else(body::empty)
        } else {
            body::empty()
        };
        let forward_req = out.into_request(forward_body)?;
        let forward_hooks = hooks.clone();
        let forward_cb = error_cb.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.request(forward_req).await {
                let err = ProxyError::Forward(Box::new(client::classify_client_error(err)));
                forward_hooks.deliver_error(forward_cb.as_ref(), &err);
            }
        });
        if options.resolved_target().is_none() {
            let response = Response::builder()
                .status(StatusCode::OK)
                .body(body::empty())?;
            return Ok(WebFlow::Done(response));
        }
    }

    let out = build_outgoing(&options, &parts, Which::Target)?;
    let transport = client::transport_for(&out)?;
    let mut proxy_req = out.into_request(inbound_body.take().unwrap_or_else(body::empty))?;
    // Hold the hook back while an Expect continuation is pending.
    if !parts.headers.contains_key(EXPECT) {
        hooks.emit_proxy_req(&mut proxy_req, &parts, &options);
    }

    debug!(uri = %proxy_req.uri(), "forwarding request upstream");
    let request_future = transport.request(proxy_req);
    let result = match options.outbound_timeout() {
        Some(limit) => match tokio::time::timeout(limit, request_future).await {
            Ok(result) => result,
            Err(_) => return Err(ProxyError::UpstreamTimeout(limit)),
        },
        None => request_future.await,
    };
    let upstream_res = result.map_err(client::classify_client_error)?;

    let outbound_idle = options.outbound_timeout();
    let mut response = upstream_res.map(|upstream_body| {
        let boxed = body::from_incoming(upstream_body);
        match outbound_idle {
            Some(idle) => BoxBody::new(IdleTimeoutBody::new(boxed, idle)),
            None => boxed,
        }
    });
    hooks.emit_proxy_res(&mut response, &parts);

    if options.self_handle_response_enabled() {
        return Ok(WebFlow::Done(response));
    }

    rewrite::remove_chunked(&parts, &mut response);
    rewrite::set_connection(&parts, &mut response);
    rewrite::rewrite_redirect(&options, &parts, &mut response);
    rewrite::rewrite_cookies(&options, &mut response);

    let end_hooks = hooks.clone();
    let response = response.map(move |client_body| {
        BoxBody::new(TapBody::new(client_body, move || end_hooks.emit_end()))
    });
    Ok(WebFlow::Done(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Hooks;
    use crate::options::ProxyOptions;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn ctx_with(req: hyper::Request<crate::body::ProxyBody>) -> WebContext {
        WebContext {
            req,
            peer: PeerInfo {
                remote_addr: Some("192.0.2.7:51000".parse::<SocketAddr>().unwrap()),
                encrypted: false,
            },
            options: ProxyOptions {
                xfwd: Some(true),
                ..Default::default()
            },
            hooks: Arc::new(Hooks::new()),
            error_cb: None,
        }
    }

    fn request(method: Method, uri: &str) -> hyper::Request<crate::body::ProxyBody> {
        hyper::Request::builder()
            .method(method)
            .uri(uri)
            .body(body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_delete_length_pins_zero() {
        let ctx = ctx_with(request(Method::DELETE, "/x"));
        let flow = delete_length(ctx).await.unwrap();
        let WebFlow::Continue(ctx) = flow else {
            panic!("pass must continue")
        };
        assert_eq!(ctx.req.headers().get(CONTENT_LENGTH).unwrap(), "0");
        assert!(ctx.req.headers().get(TRANSFER_ENCODING).is_none());
    }

    #[tokio::test]
    async fn test_delete_length_respects_existing_length() {
        let mut req = request(Method::DELETE, "/x");
        req.headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        let flow = delete_length(ctx_with(req)).await.unwrap();
        let WebFlow::Continue(ctx) = flow else {
            panic!("pass must continue")
        };
        assert_eq!(ctx.req.headers().get(CONTENT_LENGTH).unwrap(), "12");
    }

    #[tokio::test]
    async fn test_delete_length_ignores_get() {
        let flow = delete_length(ctx_with(request(Method::GET, "/x")))
            .await
            .unwrap();
        let WebFlow::Continue(ctx) = flow else {
            panic!("pass must continue")
        };
        assert!(ctx.req.headers().get(CONTENT_LENGTH).is_none());
    }

    #[tokio::test]
    async fn test_xfwd_appends_triple() {
        let mut req = request(Method::GET, "/x");
        req.headers_mut()
            .insert(HOST, HeaderValue::from_static("example:8080"));
        let flow = x_headers(ctx_with(req)).await.unwrap();
        let WebFlow::Continue(ctx) = flow else {
            panic!("pass must continue")
        };
        let headers = ctx.req.headers();
        assert_eq!(headers.get(&X_FORWARDED_FOR).unwrap(), "192.0.2.7");
        assert_eq!(headers.get(&X_FORWARDED_PORT).unwrap(), "8080");
        assert_eq!(headers.get(&X_FORWARDED_PROTO).unwrap(), "http");
    }

    #[tokio::test]
    async fn test_xfwd_accumulates_across_runs() {
        let flow = x_headers(ctx_with(request(Method::GET, "/x")))
            .await
            .unwrap();
        let WebFlow::Continue(mut ctx) = flow else {
            panic!("pass must continue")
        };
        ctx.peer.remote_addr = Some("198.51.100.4:2000".parse().unwrap());
        let flow = x_headers(ctx).await.unwrap();
        let WebFlow::Continue(ctx) = flow else {
            panic!("pass must continue")
        };
        assert_eq!(
            ctx.req.headers().get(&X_FORWARDED_FOR).unwrap(),
            "192.0.2.7,198.51.100.4"
        );
        assert_eq!(ctx.req.headers().get(&X_FORWARDED_PORT).unwrap(), "80,80");
        assert_eq!(
            ctx.req.headers().get(&X_FORWARDED_PROTO).unwrap(),
            "http,http"
        );
    }

    #[tokio::test]
    async fn test_xfwd_disabled_is_a_no_op() {
        let mut ctx = ctx_with(request(Method::GET, "/x"));
        ctx.options.xfwd = Some(false);
        let flow = x_headers(ctx).await.unwrap();
        let WebFlow::Continue(ctx) = flow else {
            panic!("pass must continue")
        };
        assert!(ctx.req.headers().get(&X_FORWARDED_FOR).is_none());
    }

    #[test]
    fn test_forwarded_port_defaults() {
        let headers = HeaderMap::new();
        assert_eq!(forwarded_port(&headers, false), "80");
        assert_eq!(forwarded_port(&headers, true), "443");
    }
}
