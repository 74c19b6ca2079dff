//! The engine facade: every operation the embedding boundary calls.
//!
//! An [`Engine`] owns its own multi-thread tokio runtime, so the whole
//! surface is synchronous and callable from any foreign thread. Server
//! and endpoint objects live behind generation-tagged handles; request
//! state is addressed by numeric id. Callbacks out to the embedder run
//! on the blocking pool, which keeps a slow or re-entrant handler from
//! stalling the I/O workers.
//!
//! Handles returned here are plain `i32` values on the wire; anything
//! stale or foreign resolves to [`Error::InvalidHandle`] rather than
//! touching freed state.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};

use crate::dispatch::{Dispatcher, DispatcherSlot};
use crate::error::{Error, Result};
use crate::handle::{Handle, HandleKind, HandleTable};
use crate::registry::RequestRegistry;
use crate::response::mime_for_path;
use crate::server::{self, ServerInner};
use crate::websocket::WsEndpoint;

/// Engine-wide tunables. The defaults suit an embedded server that
/// fronts interactive handlers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a dispatched request may wait for its terminal send
    /// before the engine answers 504 on its behalf.
    pub request_timeout: Duration,
    /// Largest request body the engine will buffer; anything larger is
    /// answered with 413.
    pub max_body_size: usize,
    /// How long `stop_server` waits for in-flight requests to finish
    /// before force-closing connections.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// State shared between the facade and every spawned task. Tasks hold
/// this, never the runtime, so dropping the last [`Engine`] clone can
/// actually shut the runtime down.
pub(crate) struct EngineShared {
    pub config: EngineConfig,
    pub servers: HandleTable<ServerInner>,
    pub endpoints: HandleTable<WsEndpoint>,
    pub requests: RequestRegistry,
    pub dispatcher: DispatcherSlot,
    pub server_handles: Mutex<Vec<Handle>>,
}

impl EngineShared {
    pub(crate) fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            servers: HandleTable::new(HandleKind::Server),
            endpoints: HandleTable::new(HandleKind::Endpoint),
            requests: RequestRegistry::new(),
            dispatcher: DispatcherSlot::new(),
            server_handles: Mutex::new(Vec::new()),
        })
    }
}

/// The embeddable HTTP/WebSocket server engine.
///
/// Cheap to clone; clones share all servers, endpoints, and the
/// dispatcher. All methods are blocking and thread-safe.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
    runtime: Arc<Runtime>,
}

impl Engine {
    /// Create an engine with default configuration.
    pub fn new() -> Result<Engine> {
        Engine::with_config(EngineConfig::default())
    }

    /// Create an engine with explicit configuration.
    pub fn with_config(config: EngineConfig) -> Result<Engine> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("gale-worker")
            .build()?;
        info!("engine started");
        Ok(Engine {
            shared: EngineShared::new(config),
            runtime: Arc::new(runtime),
        })
    }

    /// Install the embedder's dispatcher. Replaces any previous one;
    /// requests already past dispatch keep the instance they saw.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        self.shared.dispatcher.set(dispatcher);
        debug!("dispatcher installed");
    }

    // ------------------------------------------------------------------
    // Server lifecycle
    // ------------------------------------------------------------------

    /// Bind a listener and start accepting. Port 0 picks a free port;
    /// the bound port is readable through [`Engine::server_port`].
    pub fn create_server(&self, port: u16) -> Result<Handle> {
        let std_listener = server::bind_listener(port)?;
        let actual_port = std_listener
            .local_addr()
            .map_err(|source| Error::PortUnavailable { port, source })?
            .port();

        let (inner, shutdown_rx) = ServerInner::new(actual_port);
        let handle = self.shared.servers.allocate(Arc::clone(&inner))?;
        inner.set_handle(handle);

        let listener = {
            let _enter = self.runtime.enter();
            TcpListener::from_std(std_listener)
        };
        let listener = match listener {
            Ok(listener) => listener,
            Err(source) => {
                // Leave nothing behind on a failed creation.
                self.shared.servers.release(handle);
                return Err(Error::PortUnavailable { port, source });
            }
        };

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        inner.set_accept_done(done_rx);
        inner.mark_listening();
        self.shared.server_handles.lock().push(handle);
        self.runtime.spawn(server::accept_loop(
            Arc::clone(&self.shared),
            inner,
            listener,
            shutdown_rx,
            done_tx,
        ));
        info!(%handle, port = actual_port, "server listening");
        Ok(handle)
    }

    /// True only while the server accepts connections.
    pub fn is_running(&self, server: Handle) -> bool {
        self.shared
            .servers
            .resolve(server)
            .map(|inner| inner.is_running())
            .unwrap_or(false)
    }

    /// The port the server is actually bound to.
    pub fn server_port(&self, server: Handle) -> Result<u16> {
        Ok(self.resolve_server(server)?.port)
    }

    /// Stop accepting, drain in-flight requests up to the grace period,
    /// close websocket connections, and invalidate the handle. A second
    /// call with the same handle reports `InvalidHandle`.
    pub fn stop_server(&self, server: Handle) -> Result<()> {
        let inner = self
            .shared
            .servers
            .release(server)
            .ok_or(Error::InvalidHandle)?;
        self.shared.server_handles.lock().retain(|h| *h != server);

        let shared = Arc::clone(&self.shared);
        self.runtime.block_on(inner.shutdown(&shared));
        Ok(())
    }

    /// Stop every server this engine still owns.
    pub fn shutdown(&self) {
        let handles: Vec<Handle> = self.shared.server_handles.lock().drain(..).collect();
        for handle in handles {
            if let Some(inner) = self.shared.servers.release(handle) {
                let shared = Arc::clone(&self.shared);
                self.runtime.block_on(inner.shutdown(&shared));
            }
        }
    }

    // ------------------------------------------------------------------
    // Routes and middleware
    // ------------------------------------------------------------------

    /// Register `handler` for (method, path). Re-registering the same
    /// pair replaces the handler name.
    pub fn add_route(&self, server: Handle, method: &str, path: &str, handler: &str) -> Result<()> {
        let inner = self.resolve_server(server)?;
        let method = normalize_method(method)?;
        let replaced = inner
            .routes
            .write()
            .insert(&method, path, handler.to_string())?;
        if let Some(old) = replaced {
            debug!(port = inner.port, %method, path, old = %old, new = handler, "route replaced");
        } else {
            debug!(port = inner.port, %method, path, handler, "route added");
        }
        Ok(())
    }

    /// Delete the route registered under exactly (method, path). Missing
    /// keys are a no-op.
    pub fn remove_route(&self, server: Handle, method: &str, path: &str) -> Result<()> {
        let inner = self.resolve_server(server)?;
        let method = normalize_method(method)?;
        if inner.routes.write().remove(&method, path).is_some() {
            debug!(port = inner.port, %method, path, "route removed");
        }
        Ok(())
    }

    /// Append a middleware name to the server's chain. Requests snapshot
    /// the chain when they enter it, so this never affects requests
    /// already dispatched.
    pub fn use_middleware(&self, server: Handle, name: &str) -> Result<()> {
        let inner = self.resolve_server(server)?;
        inner.middleware.append(name);
        debug!(port = inner.port, middleware = name, "middleware appended");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Request read accessors
    // ------------------------------------------------------------------
    // Unknown or completed ids answer the boundary's empty-string
    // sentinel, never an error.

    pub fn request_method(&self, request_id: u64) -> String {
        self.shared
            .requests
            .get(request_id)
            .map(|slot| slot.data.method.clone())
            .unwrap_or_default()
    }

    pub fn request_path(&self, request_id: u64) -> String {
        self.shared
            .requests
            .get(request_id)
            .map(|slot| slot.data.path.clone())
            .unwrap_or_default()
    }

    /// First value of `name`, compared case-insensitively.
    pub fn request_header(&self, request_id: u64, name: &str) -> String {
        self.shared
            .requests
            .get(request_id)
            .and_then(|slot| slot.data.header(name).map(str::to_string))
            .unwrap_or_default()
    }

    /// The buffered request body as UTF-8 text.
    pub fn request_body(&self, request_id: u64) -> String {
        self.shared
            .requests
            .get(request_id)
            .map(|slot| String::from_utf8_lossy(&slot.data.body).into_owned())
            .unwrap_or_default()
    }

    /// Decoded query parameter; the last occurrence wins on duplicates.
    pub fn query_param(&self, request_id: u64, name: &str) -> String {
        self.shared
            .requests
            .get(request_id)
            .and_then(|slot| slot.data.query_param(name).map(str::to_string))
            .unwrap_or_default()
    }

    /// Captured `:param` value from the matched route.
    pub fn route_param(&self, request_id: u64, name: &str) -> String {
        self.shared
            .requests
            .get(request_id)
            .and_then(|slot| slot.data.route_param(name).map(str::to_string))
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Response writer
    // ------------------------------------------------------------------

    /// Append a header to the pending response. Duplicate names are
    /// kept in order, not replaced.
    pub fn set_response_header(&self, request_id: u64, name: &str, value: &str) -> Result<()> {
        let slot = self
            .shared
            .requests
            .get(request_id)
            .ok_or(Error::InvalidHandle)?;
        slot.append_header(name, value)
    }

    /// Terminal send with an explicit content type. At most one terminal
    /// send succeeds per request; later attempts report
    /// [`Error::ResponseAlreadySent`] and change nothing on the wire.
    pub fn send_response(
        &self,
        request_id: u64,
        status: u16,
        content_type: &str,
        body: &str,
    ) -> Result<()> {
        let slot = self
            .shared
            .requests
            .get(request_id)
            .ok_or(Error::InvalidHandle)?;
        slot.finish(status, content_type, Bytes::copy_from_slice(body.as_bytes()))
    }

    /// Terminal send of a JSON document.
    pub fn send_json_response(&self, request_id: u64, status: u16, json: &str) -> Result<()> {
        self.send_response(request_id, status, "application/json", json)
    }

    /// Terminal send of a file's contents, content type inferred from
    /// the extension. An unreadable path answers the client with 404 or
    /// 500 instead of failing the call.
    pub fn send_file_response(&self, request_id: u64, file_path: &str) -> Result<()> {
        let slot = self
            .shared
            .requests
            .get(request_id)
            .ok_or(Error::InvalidHandle)?;
        match std::fs::read(file_path) {
            Ok(contents) => slot.finish(200, mime_for_path(file_path), Bytes::from(contents)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                warn!(request_id, file_path, "file not found");
                slot.finish(404, "text/plain", Bytes::from_static(b"File not found"))
            }
            Err(error) => {
                error!(request_id, file_path, %error, "file read failed");
                slot.finish(500, "text/plain", Bytes::from_static(b"Internal Server Error"))
            }
        }
    }

    // ------------------------------------------------------------------
    // WebSocket hub
    // ------------------------------------------------------------------

    /// Register a websocket upgrade target on `path`. Matching GET
    /// requests with upgrade headers are promoted off the HTTP pipeline.
    pub fn create_websocket_endpoint(&self, server: Handle, path: &str) -> Result<Handle> {
        let inner = self.resolve_server(server)?;
        let endpoint = WsEndpoint::new(server, path.to_string());
        let handle = self.shared.endpoints.allocate(Arc::clone(&endpoint))?;
        endpoint.set_handle(handle);

        // Upgrade requests arrive as GET.
        let replaced = match inner.ws_routes.write().insert("GET", path, handle) {
            Ok(replaced) => replaced,
            Err(error) => {
                self.shared.endpoints.release(handle);
                return Err(error.into());
            }
        };
        if let Some(old) = replaced {
            // The path now points at the new endpoint; retire the old one.
            inner.owned_endpoints.lock().retain(|h| *h != old);
            if let Some(old_endpoint) = self.shared.endpoints.release(old) {
                self.runtime
                    .block_on(old_endpoint.close_all(&self.shared.dispatcher));
            }
        }
        inner.owned_endpoints.lock().push(handle);
        info!(server = %server, endpoint = %handle, path, "websocket endpoint created");
        Ok(handle)
    }

    /// Deliver a text message to one connected client.
    pub fn send_websocket_message(
        &self,
        endpoint: Handle,
        client_id: &str,
        message: &str,
    ) -> Result<()> {
        let endpoint = self.resolve_endpoint(endpoint)?;
        self.runtime
            .block_on(endpoint.send_text(&self.shared.dispatcher, client_id, message))
    }

    /// Deliver a text message to every client connected right now.
    /// Returns how many deliveries were started; individual failures
    /// evict the failing client without affecting the rest.
    pub fn broadcast_websocket_message(&self, endpoint: Handle, message: &str) -> Result<usize> {
        let endpoint = self.resolve_endpoint(endpoint)?;
        Ok(self
            .runtime
            .block_on(endpoint.broadcast_text(&self.shared.dispatcher, message)))
    }

    /// Close one client's connection. Unknown or already-closed ids are
    /// a no-op.
    pub fn close_websocket_connection(&self, endpoint: Handle, client_id: &str) -> Result<()> {
        let endpoint = self.resolve_endpoint(endpoint)?;
        self.runtime
            .block_on(endpoint.close_client(&self.shared.dispatcher, client_id));
        Ok(())
    }

    /// Number of clients currently connected to the endpoint.
    pub fn websocket_client_count(&self, endpoint: Handle) -> Result<usize> {
        Ok(self.resolve_endpoint(endpoint)?.client_count())
    }

    // ------------------------------------------------------------------

    fn resolve_server(&self, handle: Handle) -> Result<Arc<ServerInner>> {
        self.shared.servers.resolve(handle).ok_or(Error::InvalidHandle)
    }

    fn resolve_endpoint(&self, handle: Handle) -> Result<Arc<WsEndpoint>> {
        self.shared
            .endpoints
            .resolve(handle)
            .ok_or(Error::InvalidHandle)
    }
}

/// Uppercase and validate an HTTP method token.
fn normalize_method(method: &str) -> Result<String> {
    if method.is_empty()
        || !method
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
    {
        return Err(Error::InvalidMethod(method.to_string()));
    }
    Ok(method.to_ascii_uppercase())
}
