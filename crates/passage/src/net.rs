//! Listener and raw-stream utilities.
//!
//! The listener owns the first bytes of every connection: it reads the
//! request head, decides between the plain-HTTP and upgrade pipelines, and
//! replays whatever it consumed (via [`Rewind`]) to whichever side takes
//! over.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, UPGRADE};
use hyper::{Request, Response, Version};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ProxyError;

/// Maximum bytes of request head the listener will buffer before giving up.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Object-safe alias for a bidirectional byte stream.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

/// Access to the TCP stream under a possibly TLS-wrapped connection, for
/// socket tuning.
pub(crate) trait TcpStreamRef {
    fn tcp_stream(&self) -> &TcpStream;
}

impl TcpStreamRef for TcpStream {
    fn tcp_stream(&self) -> &TcpStream {
        self
    }
}

impl TcpStreamRef for tokio_rustls::server::TlsStream<TcpStream> {
    fn tcp_stream(&self) -> &TcpStream {
        self.get_ref().0
    }
}

/// Create a TCP listener with address (and, on Unix, port) reuse enabled.
pub(crate) fn create_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Enable TCP keep-alive (no initial delay tuning; TCP_NODELAY is
/// deliberately left unset, so Nagle stays on).
pub(crate) fn tune_keepalive(stream: &TcpStream) {
    #[cfg(unix)]
    {
        let sock = socket2::SockRef::from(stream);
        if let Err(err) = sock.set_keepalive(true) {
            debug!(error = %err, "failed to enable keep-alive on client socket");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = stream;
    }
}

/// A stream that replays a prefix buffer before reading from the inner
/// stream. Used to push head bytes back in front of a hijacked connection.
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: impl Into<Bytes>, inner: S) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Read from the stream until the end of the request head (`\r\n\r\n`).
///
/// Returns the full buffer read so far and the offset one past the head
/// terminator. Bytes beyond the offset belong to the body or, for upgrades,
/// to the post-handshake stream.
pub(crate) async fn read_request_head<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<(Vec<u8>, usize), ProxyError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::ClientGone);
        }
        // Rescan a few bytes back in case the terminator straddles reads.
        let scan_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buf[scan_from..]) {
            return Ok((buf, scan_from + pos));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request head too large",
            )));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Parse a buffered request head into an `http::Request` with an empty body.
pub(crate) fn parse_request_head(head: &[u8]) -> Result<Request<()>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut headers);
    let status = parsed.parse(head).map_err(|e| {
        ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("malformed request head: {e}"),
        ))
    })?;
    if !matches!(status, httparse::Status::Complete(_)) {
        return Err(ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "incomplete request head",
        )));
    }

    let method = parsed.method.unwrap_or("GET");
    let path = parsed.path.unwrap_or("/");
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .version(version)
        .body(())
        .map_err(ProxyError::from)?;
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|e| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid header name: {e}"),
            ))
        })?;
        let value = HeaderValue::from_bytes(header.value).map_err(|e| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid header value: {e}"),
            ))
        })?;
        request.headers_mut().append(name, value);
    }
    Ok(request)
}

/// Whether the request head asks for a WebSocket upgrade.
pub(crate) fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Serialize a response head the way it goes on the wire: status line, one
/// `Key: Value` line per header (array-valued headers repeat the line), then
/// the blank line.
pub(crate) fn response_head_bytes<B>(res: &Response<B>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    let version = match res.version() {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let status = res.status();
    let reason = res
        .extensions()
        .get::<hyper::ext::ReasonPhrase>()
        .map(|r| r.as_bytes().to_vec())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("").as_bytes().to_vec());

    buf.extend_from_slice(version.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status.as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(&reason);
    buf.extend_from_slice(b"\r\n");

    for (name, value) in res.headers() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_request_head_basic() {
        let head = b"GET /chat HTTP/1.1\r\nHost: example\r\nUpgrade: websocket\r\n\r\n";
        let req = parse_request_head(head).unwrap();
        assert_eq!(req.method(), hyper::Method::GET);
        assert_eq!(req.uri().path(), "/chat");
        assert_eq!(req.headers().get("host").unwrap(), "example");
        assert!(is_websocket_upgrade(&req));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_request_head(b"\x00\x01\x02\r\n\r\n").is_err());
    }

    #[test]
    fn test_upgrade_detection_is_case_insensitive() {
        let head = b"GET / HTTP/1.1\r\nUpgrade: WebSocket\r\n\r\n";
        let req = parse_request_head(head).unwrap();
        assert!(is_websocket_upgrade(&req));

        let head = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let req = parse_request_head(head).unwrap();
        assert!(!is_websocket_upgrade(&req));
    }

    #[tokio::test]
    async fn test_read_request_head_finds_boundary_and_remainder() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let payload = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n\xAB\xCD";
        client.write_all(payload).await.unwrap();
        drop(client);

        let (buf, head_end) = read_request_head(&mut server).await.unwrap();
        assert_eq!(&buf[..head_end], b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(&buf[head_end..], b"\xAB\xCD");
    }

    #[tokio::test]
    async fn test_rewind_replays_prefix_first() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b" world").await.unwrap();
        drop(client);

        let mut rewound = Rewind::new(Bytes::from_static(b"hello"), server);
        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut rewound, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn test_response_head_serialization() {
        let mut res = Response::builder()
            .status(hyper::StatusCode::SWITCHING_PROTOCOLS)
            .body(())
            .unwrap();
        res.headers_mut()
            .insert("connection", HeaderValue::from_static("Upgrade"));
        res.headers_mut()
            .insert("upgrade", HeaderValue::from_static("websocket"));
        let bytes = response_head_bytes(&res);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("connection: Upgrade\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
