//! gale-core: embeddable HTTP/WebSocket server engine
//!
//! The engine behind a foreign-language server binding: servers are
//! created and addressed through opaque integer handles, routes map
//! (method, path) to handler names, and the embedder answers requests
//! through numeric request ids from its own thread. WebSocket endpoints
//! promote matching upgrade requests into tracked connections with
//! unicast and broadcast delivery.
//!
//! The [`Engine`] owns its runtime; the whole API is synchronous and
//! safe to call from any thread. Wire the embedder in by implementing
//! [`Dispatcher`] and installing it with [`Engine::set_dispatcher`].

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod codec;
mod dispatch;
mod engine;
pub mod error;
mod handle;
mod middleware;
mod registry;
mod request;
mod response;
mod server;
pub mod websocket;

// Re-exports
pub use error::{Error, Result};
pub use engine::{Engine, EngineConfig};
pub use handle::Handle;

// Dispatch contract re-exports
pub use dispatch::{Dispatcher, MiddlewareDecision};

// Codec re-exports
pub use codec::{generate_uuid, percent_decode, percent_encode};

// WebSocket wire-level re-exports, mainly for test clients
pub use websocket::frame::{Frame as WebSocketFrame, Opcode as WebSocketOpcode};
pub use websocket::handshake::accept_key as websocket_accept_key;
