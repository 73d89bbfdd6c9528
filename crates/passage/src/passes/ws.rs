//! The WebSocket upgrade passes.
//!
//! Order is fixed: `check_method_and_header`, `x_headers`, then the terminal
//! `stream` pass that performs the upstream handshake and splices the two
//! raw streams together.

use http_body_util::BodyExt;
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::web::append_xfwd;
use super::{WsContext, WsFlow};
use crate::body;
use crate::client;
use crate::error::{source_io_kind, ProxyError};
use crate::events::{ErrorCallback, Hooks};
use crate::net::{self, RawStream, Rewind};
use crate::outgoing::{build_outgoing, Which};

/// Reject anything that is not a `GET` with `Upgrade: websocket`.
pub(crate) async fn check_method_and_header(mut ctx: WsContext) -> Result<WsFlow, ProxyError> {
    if ctx.req.method() != Method::GET || !net::is_websocket_upgrade(&ctx.req) {
        let _ = ctx.io.shutdown().await;
        return Ok(WsFlow::Done);
    }
    Ok(WsFlow::Continue(ctx))
}

pub(crate) async fn x_headers(mut ctx: WsContext) -> Result<WsFlow, ProxyError> {
    if ctx.options.xfwd_enabled() {
        let peer = ctx.peer;
        let proto = if peer.encrypted { "wss" } else { "ws" };
        append_xfwd(ctx.req.headers_mut(), &peer, proto);
    }
    Ok(WsFlow::Continue(ctx))
}

fn classify_hyper_error(err: hyper::Error) -> ProxyError {
    if source_io_kind(&err, std::io::ErrorKind::ConnectionReset) {
        ProxyError::UpstreamReset(Box::new(err))
    } else {
        ProxyError::Upstream(Box::new(err))
    }
}

/// Deliver an upstream-side failure, then half-close the client socket.
async fn on_outgoing_error(
    hooks: &Hooks,
    error_cb: Option<&ErrorCallback>,
    err: ProxyError,
    mut client_io: Box<dyn RawStream>,
) -> Result<WsFlow, ProxyError> {
    hooks.deliver_error(error_cb, &err);
    let _ = client_io.shutdown().await;
    Ok(WsFlow::Done)
}

/// The terminal upgrade pass: dial the upstream, perform the HTTP/1.1
/// handshake, and either relay a refusal or splice the post-handshake
/// streams together.
pub(crate) async fn stream(ctx: WsContext) -> Result<WsFlow, ProxyError> {
    let WsContext {
        req,
        io,
        head,
        peer: _,
        options,
        hooks,
        error_cb,
    } = ctx;
    let (parts, ()) = req.into_parts();
    hooks.emit_start(&parts);
    let out = build_outgoing(&options, &parts, Which::Target)?;

    // Replay bytes read past the request-head boundary in front of the
    // client stream so the upstream sees them at stream start.
    let mut client_io: Box<dyn RawStream> = if head.is_empty() {
        io
    } else {
        Box::new(Rewind::new(head, io))
    };

    let upstream = match client::connect_upstream(&out).await {
        Ok(stream) => stream,
        Err(err) => return on_outgoing_error(&hooks, error_cb.as_ref(), err, client_io).await,
    };
    let mut sender = match client::http1_handshake(upstream).await {
        Ok(sender) => sender,
        Err(err) => return on_outgoing_error(&hooks, error_cb.as_ref(), err, client_io).await,
    };

    let mut proxy_req = match out.into_origin_request(body::empty()) {
        Ok(req) => req,
        Err(err) => return on_outgoing_error(&hooks, error_cb.as_ref(), err, client_io).await,
    };
    hooks.emit_proxy_req_ws(&mut proxy_req, &parts, &options);

    let response_future = sender.send_request(proxy_req);
    let result = match options.outbound_timeout() {
        Some(limit) => match tokio::time::timeout(limit, response_future).await {
            Ok(result) => result,
            Err(_) => {
                return on_outgoing_error(
                    &hooks,
                    error_cb.as_ref(),
                    ProxyError::UpstreamTimeout(limit),
                    client_io,
                )
                .await;
            }
        },
        None => response_future.await,
    };
    let mut upstream_res = match result {
        Ok(response) => response,
        Err(err) => {
            return on_outgoing_error(
                &hooks,
                error_cb.as_ref(),
                classify_hyper_error(err),
                client_io,
            )
            .await;
        }
    };

    if upstream_res.status() != StatusCode::SWITCHING_PROTOCOLS {
        // The upstream decided not to upgrade: relay its response verbatim
        // over the raw socket.
        let head_bytes = net::response_head_bytes(&upstream_res);
        if client_io.write_all(&head_bytes).await.is_err() {
            return Ok(WsFlow::Done);
        }
        let mut upstream_body = upstream_res.into_body();
        while let Some(frame) = upstream_body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Some(data) = frame.data_ref() {
                        if client_io.write_all(data).await.is_err() {
                            break;
                        }
                    }
                }
                Err(err) => {
                    debug!(error = %err, "upstream body ended with error");
                    break;
                }
            }
        }
        let _ = client_io.shutdown().await;
        return Ok(WsFlow::Done);
    }

    let on_upgrade = hyper::upgrade::on(&mut upstream_res);
    let head_bytes = net::response_head_bytes(&upstream_res);
    if client_io.write_all(&head_bytes).await.is_err() {
        // Client went away between handshakes; dropping the connection
        // aborts the upstream side.
        return Ok(WsFlow::Done);
    }
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(err) => {
            return on_outgoing_error(
                &hooks,
                error_cb.as_ref(),
                classify_hyper_error(err),
                client_io,
            )
            .await;
        }
    };
    let mut upstream_io = TokioIo::new(upgraded);

    hooks.emit_open();
    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => {
            hooks.emit_econnreset(&ProxyError::UpstreamReset(Box::new(err)));
        }
        Err(err) => {
            debug!(error = %err, "websocket splice ended with error");
        }
    }
    hooks.emit_close();
    Ok(WsFlow::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Hooks;
    use crate::options::ProxyOptions;
    use crate::passes::PeerInfo;
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    fn ws_ctx(req: hyper::Request<()>, io: Box<dyn RawStream>) -> WsContext {
        WsContext {
            req,
            io,
            head: Bytes::new(),
            peer: PeerInfo::default(),
            options: ProxyOptions::default(),
            hooks: Arc::new(Hooks::new()),
            error_cb: None,
        }
    }

    #[tokio::test]
    async fn test_non_get_is_rejected_and_socket_closed() {
        let (client, mut other) = tokio::io::duplex(64);
        let req = hyper::Request::builder()
            .method(Method::POST)
            .uri("/chat")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        let flow = check_method_and_header(ws_ctx(req, Box::new(client)))
            .await
            .unwrap();
        assert!(matches!(flow, WsFlow::Done));
        // The pipeline half-closed its side; reads on the peer see EOF.
        let mut buf = Vec::new();
        other.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_missing_upgrade_header_is_rejected() {
        let (client, _other) = tokio::io::duplex(64);
        let req = hyper::Request::builder()
            .method(Method::GET)
            .uri("/chat")
            .body(())
            .unwrap();
        let flow = check_method_and_header(ws_ctx(req, Box::new(client)))
            .await
            .unwrap();
        assert!(matches!(flow, WsFlow::Done));
    }

    #[tokio::test]
    async fn test_websocket_upgrade_continues() {
        let (client, _other) = tokio::io::duplex(64);
        let req = hyper::Request::builder()
            .method(Method::GET)
            .uri("/chat")
            .header("upgrade", "WebSocket")
            .body(())
            .unwrap();
        let flow = check_method_and_header(ws_ctx(req, Box::new(client)))
            .await
            .unwrap();
        assert!(matches!(flow, WsFlow::Continue(_)));
    }

    #[tokio::test]
    async fn test_ws_xfwd_uses_ws_proto() {
        let (client, _other) = tokio::io::duplex(64);
        let req = hyper::Request::builder()
            .method(Method::GET)
            .uri("/chat")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        let mut ctx = ws_ctx(req, Box::new(client));
        ctx.options.xfwd = Some(true);
        ctx.peer.remote_addr = Some("192.0.2.9:4000".parse().unwrap());
        let flow = x_headers(ctx).await.unwrap();
        let WsFlow::Continue(ctx) = flow else {
            panic!("pass must continue")
        };
        assert_eq!(
            ctx.req.headers().get("x-forwarded-proto").unwrap(),
            "ws"
        );
        assert_eq!(ctx.req.headers().get("x-forwarded-for").unwrap(), "192.0.2.9");
    }
}
