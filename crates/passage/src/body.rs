//! Body plumbing shared by the proxy passes.
//!
//! Every request and response body flowing through the pipeline is erased to
//! [`ProxyBody`] so passes can wrap, replace or stream bodies without caring
//! where they came from.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use tokio::time::{Instant, Sleep};

use crate::error::BoxError;

/// The erased body type used on both sides of the pipeline.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// An empty body.
pub fn empty() -> ProxyBody {
    BoxBody::new(Empty::<Bytes>::new().map_err(|never: Infallible| match never {}))
}

/// A body holding a single chunk.
pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    BoxBody::new(Full::new(chunk.into()).map_err(|never: Infallible| match never {}))
}

/// Erase a hyper request/response body.
pub fn from_incoming(body: Incoming) -> ProxyBody {
    BoxBody::new(body.map_err(|e| Box::new(e) as BoxError))
}

/// Body wrapper that runs a callback once the stream finishes cleanly.
///
/// Used to emit the `end` event after the upstream response body has been
/// fully relayed to the client.
pub struct TapBody {
    inner: ProxyBody,
    on_end: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl TapBody {
    pub fn new(inner: ProxyBody, on_end: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            inner,
            on_end: Some(Box::new(on_end)),
        }
    }
}

impl Body for TapBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                if let Some(on_end) = this.on_end.take() {
                    on_end();
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Body wrapper enforcing an idle deadline between frames.
///
/// The deadline resets every time the inner body makes progress; if it fires
/// while the inner body is pending, the stream errors out with a timed-out
/// I/O error.
pub struct IdleTimeoutBody {
    inner: ProxyBody,
    idle: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleTimeoutBody {
    pub fn new(inner: ProxyBody, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            sleep: Box::pin(tokio::time::sleep(idle)),
        }
    }
}

impl Body for IdleTimeoutBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(ready) => {
                let idle = this.idle;
                this.sleep.as_mut().reset(Instant::now() + idle);
                Poll::Ready(ready)
            }
            Poll::Pending => match this.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Some(Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "body idle timeout expired",
                )) as BoxError))),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_tap_body_fires_on_clean_end() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let body = TapBody::new(full("hello"), move || {
            flag.store(true, Ordering::SeqCst);
        });
        let collected = BoxBody::new(body).collect().await.unwrap();
        assert_eq!(collected.to_bytes(), Bytes::from("hello"));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_idle_timeout_passes_fast_bodies() {
        let body = IdleTimeoutBody::new(full("payload"), Duration::from_secs(5));
        let collected = BoxBody::new(body).collect().await.unwrap();
        assert_eq!(collected.to_bytes(), Bytes::from("payload"));
    }
}
