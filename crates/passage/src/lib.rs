//! Passage: a programmable HTTP and WebSocket reverse proxy library.
//!
//! The core is a pipeline of ordered, named passes. A dispatch walks the
//! appropriate pass list (`web` or `ws`) in order; early passes shape the
//! inbound request, the terminal `stream` pass performs the upstream I/O.
//! External code hooks the pipeline two ways: by inserting passes relative
//! to named stages (`before`/`after`) and by subscribing to typed events.
//!
//! ```no_run
//! use passage::{ProxyOptions, ProxyServer};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), passage::ProxyError> {
//! let server = Arc::new(ProxyServer::new(ProxyOptions {
//!     target: Some("http://upstream:8080".into()),
//!     ws: Some(true),
//!     ..Default::default()
//! })?);
//! server.on_error(|err| eprintln!("proxy error: {err}"));
//! let listening = server.listen(([127, 0, 0, 1], 8000).into()).await?;
//! # listening.close().await?;
//! # Ok(())
//! # }
//! ```

// ===== Core pipeline modules =====
pub mod body;
pub mod error;
pub mod events;
pub mod options;
pub mod outgoing;
pub mod passes;
pub mod server;
pub mod target;

// ===== Transport plumbing =====
pub mod client;
pub mod net;
pub mod tls;

pub use body::ProxyBody;
pub use client::{Agent, AgentConfig};
pub use error::ProxyError;
pub use events::{ErrorCallback, Hooks};
pub use options::{ProxyOptions, RewriteMap, SslConfig};
pub use outgoing::{build_outgoing, url_join, OutgoingRequest, Which};
pub use passes::{
    PassKind, PassList, PeerInfo, WebContext, WebFlow, WebPass, WsContext, WsFlow, WsPass,
};
pub use server::{Listening, PassStage, ProxyServer, WebArgs, WsArgs};
pub use target::{ResolvedTarget, Target, TargetTls};
