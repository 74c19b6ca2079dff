//! Error types for gale-core

use thiserror::Error;

/// Result type alias for gale operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the gale server engine
#[derive(Debug, Error)]
pub enum Error {
    /// Handle is unknown, stale, or belongs to a stopped server
    #[error("Invalid or stale handle")]
    InvalidHandle,

    /// Listener could not be bound at server creation
    #[error("Port {port} unavailable: {source}")]
    PortUnavailable {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// No route matched the request
    #[error("No route matched: {method} {path}")]
    NoRouteMatch { method: String, path: String },

    /// A terminal response was already written for this request
    #[error("Response already sent for request {request_id}")]
    ResponseAlreadySent { request_id: u64 },

    /// WebSocket client id is unknown or already closed
    #[error("Unknown WebSocket client: {client_id}")]
    UnknownWebSocketClient { client_id: String },

    /// Upgrade request was malformed or unsupported
    #[error("WebSocket upgrade failed: {0}")]
    UpgradeFailed(String),

    /// Invalid HTTP method token
    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    /// Invalid route pattern
    #[error("Invalid route pattern: {0}")]
    InvalidPath(#[from] gale_router::InsertError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
