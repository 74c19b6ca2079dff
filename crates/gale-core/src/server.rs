//! Server lifecycle and the per-request pipeline.
//!
//! Each server owns its listener, route table, middleware list, and
//! websocket endpoint routes. The accept loop hands every connection to
//! its own task; requests on one connection are served in order, while
//! connections never wait on each other. Stopping a server closes the
//! listener at once, drains in-flight requests for a bounded grace
//! period, then force-closes whatever is left.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use gale_router::Router;

use crate::dispatch::{self, HandlerOutcome};
use crate::engine::EngineShared;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::middleware::{self, ChainOutcome, MiddlewareChain};
use crate::registry::RequestRegistry;
use crate::request::RequestData;
use crate::response::Response;
use crate::websocket::{self, handshake};

pub(crate) type HttpResponse = hyper::Response<Full<Bytes>>;

/// Server lifecycle states. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Lifecycle {
    Created = 0,
    Listening = 1,
    Stopping = 2,
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Lifecycle {
        match value {
            0 => Lifecycle::Created,
            1 => Lifecycle::Listening,
            2 => Lifecycle::Stopping,
            _ => Lifecycle::Stopped,
        }
    }
}

/// Counts requests currently inside the pipeline, for the stop-time
/// drain. Guards decrement on drop so early returns and cancelled
/// futures are both covered.
pub(crate) struct InFlightTracker {
    active: AtomicU64,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self {
            active: AtomicU64::new(0),
        }
    }

    pub fn begin(&self) -> InFlightGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { tracker: self }
    }

    pub fn count(&self) -> u64 {
        self.active.load(Ordering::SeqCst)
    }
}

pub(crate) struct InFlightGuard<'a> {
    tracker: &'a InFlightTracker,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One live server: its tables, lifecycle state, and shutdown plumbing.
pub(crate) struct ServerInner {
    pub port: u16,
    handle: OnceLock<Handle>,
    lifecycle: AtomicU8,
    pub routes: RwLock<Router<String>>,
    pub middleware: MiddlewareChain,
    pub ws_routes: RwLock<Router<Handle>>,
    pub owned_endpoints: Mutex<Vec<Handle>>,
    pub in_flight: InFlightTracker,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    accept_done: Mutex<Option<oneshot::Receiver<()>>>,
    force_close: watch::Sender<bool>,
}

impl ServerInner {
    /// Build a server around an already-bound port. The returned
    /// receiver ends the accept loop when `shutdown` fires.
    pub fn new(port: u16) -> (Arc<Self>, oneshot::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (force_tx, _) = watch::channel(false);
        let server = Arc::new(Self {
            port,
            handle: OnceLock::new(),
            lifecycle: AtomicU8::new(Lifecycle::Created as u8),
            routes: RwLock::new(Router::new()),
            middleware: MiddlewareChain::new(),
            ws_routes: RwLock::new(Router::new()),
            owned_endpoints: Mutex::new(Vec::new()),
            in_flight: InFlightTracker::new(),
            shutdown: Mutex::new(Some(shutdown_tx)),
            accept_done: Mutex::new(None),
            force_close: force_tx,
        });
        (server, shutdown_rx)
    }

    pub fn set_handle(&self, handle: Handle) {
        let _ = self.handle.set(handle);
    }

    pub fn handle(&self) -> Handle {
        self.handle.get().copied().unwrap_or(Handle::INVALID)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    pub fn mark_listening(&self) {
        self.lifecycle
            .store(Lifecycle::Listening as u8, Ordering::Release);
    }

    /// Move `Listening -> Stopping`. Only the first caller gets `true`.
    pub fn begin_stop(&self) -> bool {
        self.lifecycle
            .compare_exchange(
                Lifecycle::Listening as u8,
                Lifecycle::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn mark_stopped(&self) {
        self.lifecycle
            .store(Lifecycle::Stopped as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Listening
    }

    pub fn subscribe_force_close(&self) -> watch::Receiver<bool> {
        self.force_close.subscribe()
    }

    /// Arm the accept-loop completion signal before the loop is spawned.
    pub fn set_accept_done(&self, done: oneshot::Receiver<()>) {
        *self.accept_done.lock() = Some(done);
    }

    /// Full teardown: stop accepting, drain, close websockets, force
    /// out whatever is still connected. Idempotent after the first call.
    pub async fn shutdown(self: &Arc<Self>, shared: &Arc<EngineShared>) {
        if !self.begin_stop() {
            return;
        }
        info!(port = self.port, "server stopping");

        // Ends the accept loop and drops the listener, freeing the port.
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
        // Wait until the loop has actually released the listener, so the
        // port is rebindable the moment this returns.
        let accept_done = self.accept_done.lock().take();
        if let Some(done) = accept_done {
            let _ = done.await;
        }

        // Bounded drain of in-flight requests.
        let start = Instant::now();
        while self.in_flight.count() > 0 && start.elapsed() < shared.config.shutdown_grace {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let remaining = self.in_flight.count();
        if remaining > 0 {
            warn!(
                port = self.port,
                remaining, "grace period expired with requests still in flight"
            );
        }

        // Close websocket connections while their transports still work,
        // then release the endpoint handles.
        let endpoints: Vec<Handle> = std::mem::take(&mut *self.owned_endpoints.lock());
        for handle in endpoints {
            if let Some(endpoint) = shared.endpoints.release(handle) {
                endpoint.close_all(&shared.dispatcher).await;
            }
        }

        // Kick remaining connections and websocket read loops, then wait
        // for the tasks holding a close signal to let go of it: zero
        // receivers means zero surviving transports. A peer stalled
        // mid-write keeps its task alive, so the wait is bounded.
        let _ = self.force_close.send(true);
        let _ = tokio::time::timeout(shared.config.shutdown_grace, self.force_close.closed()).await;

        // The severed requests' contexts go with their connections;
        // callbacks on those ids miss from here on.
        let swept = shared.requests.remove_for_server(self.handle());
        if swept > 0 {
            debug!(port = self.port, swept, "released contexts of force-closed requests");
        }

        self.mark_stopped();
        info!(port = self.port, "server stopped");
    }
}

/// Bind a listener the way the engine wants it: address reuse for quick
/// restarts, Nagle off, and a failure mapped to `PortUnavailable`. Port
/// reuse stays off so a second server on a busy port fails its bind.
pub(crate) fn bind_listener(port: u16) -> Result<StdTcpListener> {
    let to_error = |source: std::io::Error| Error::PortUnavailable { port, source };

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(to_error)?;
    socket.set_reuse_address(true).map_err(to_error)?;
    socket.set_nodelay(true).map_err(to_error)?;
    socket.bind(&addr.into()).map_err(to_error)?;
    socket.listen(1024).map_err(to_error)?;

    let listener: StdTcpListener = socket.into();
    listener.set_nonblocking(true).map_err(to_error)?;
    Ok(listener)
}

/// Accept connections until the shutdown signal fires. Signals `done`
/// once the listener is dropped and the port is free again.
pub(crate) async fn accept_loop(
    shared: Arc<EngineShared>,
    server: Arc<ServerInner>,
    listener: TcpListener,
    shutdown_rx: oneshot::Receiver<()>,
    done: oneshot::Sender<()>,
) {
    tokio::select! {
        _ = async {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(port = server.port, %error, "accept failed");
                        continue;
                    }
                };

                // Reject new connections once stopping has begun.
                if !server.is_running() {
                    drop(stream);
                    continue;
                }

                let shared = Arc::clone(&shared);
                let server = Arc::clone(&server);
                tokio::spawn(serve_connection(shared, server, stream));
            }
        } => {}
        _ = shutdown_rx => {
            debug!(port = server.port, "accept loop ended");
        }
    }

    drop(listener);
    let _ = done.send(());
}

/// Serve one connection, keep-alive included, until the peer hangs up
/// or the server forces it closed.
async fn serve_connection(shared: Arc<EngineShared>, server: Arc<ServerInner>, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);
    let mut force_close = server.subscribe_force_close();

    let service_shared = Arc::clone(&shared);
    let service_server = Arc::clone(&server);
    let service = service_fn(move |req| {
        let shared = Arc::clone(&service_shared);
        let server = Arc::clone(&service_server);
        async move { handle_request(shared, server, req).await }
    });

    let conn = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades();
    tokio::pin!(conn);

    // The force-close arm is checked first so a signalled connection is
    // dropped without another poll of the request pipeline.
    tokio::select! {
        biased;
        _ = wait_for_force_close(&mut force_close) => {
            // Dropping the connection severs the transport and cancels
            // any request future still in the pipeline; the request
            // guard releases its context slot.
            debug!("connection force-closed");
        }
        result = conn.as_mut() => {
            if let Err(error) = result {
                let message = error.to_string();
                if !message.contains("connection closed") {
                    debug!(%error, "connection ended with error");
                }
            }
        }
    }
}

async fn wait_for_force_close(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        // A dropped sender means the server is gone; treat it the same.
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// The request pipeline: upgrade check, route, body cap, context
/// allocation, middleware, handler dispatch, response wait.
async fn handle_request(
    shared: Arc<EngineShared>,
    server: Arc<ServerInner>,
    mut req: hyper::Request<Incoming>,
) -> std::result::Result<HttpResponse, hyper::Error> {
    let _guard = server.in_flight.begin();

    let method = req.method().as_str().to_ascii_uppercase();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    // Upgrade requests that match a websocket endpoint leave the HTTP
    // pipeline here. Non-matching upgrades fall through to routing.
    if handshake::is_upgrade_request(req.headers()) {
        let target = server
            .ws_routes
            .read()
            .find(&method, &path)
            .and_then(|matched| shared.endpoints.resolve(matched.value));
        if let Some(endpoint) = target {
            let force_close = server.subscribe_force_close();
            let response = match websocket::try_upgrade(
                endpoint,
                shared.dispatcher.clone(),
                &mut req,
                force_close,
            ) {
                Ok(response) => response,
                Err(error) => {
                    warn!(%path, %error, "websocket upgrade rejected");
                    Response::bad_request(&error.to_string()).into_hyper()
                }
            };
            return Ok(response);
        }
    }

    // Route before reading the body so a miss allocates nothing.
    let matched = server.routes.read().find(&method, &path);
    let Some(matched) = matched else {
        debug!(%method, %path, "no route matched");
        return Ok(Response::not_found().into_hyper());
    };

    let headers = req.headers().clone();
    let body = match read_body(req, shared.config.max_body_size).await? {
        Ok(body) => body,
        Err(response) => return Ok(response.into_hyper()),
    };

    let request_id = shared.requests.allocate_id();
    let data = RequestData::new(
        request_id,
        server.handle(),
        method,
        path,
        query.as_deref(),
        &headers,
        matched.params,
        body,
    );
    let rx = shared.requests.insert(data);
    let _request_guard = RequestGuard {
        registry: &shared.requests,
        request_id,
    };

    let dispatcher = shared.dispatcher.get();
    let chain = server.middleware.snapshot();
    match middleware::run_chain(dispatcher.clone(), chain, request_id).await {
        ChainOutcome::Completed => {}
        ChainOutcome::ShortCircuited => {
            return Ok(await_response(rx, &shared, request_id).await.into_hyper());
        }
        ChainOutcome::Failed => {
            return Ok(Response::internal_error("Middleware failure").into_hyper());
        }
    }

    match dispatch::invoke_handler(dispatcher, matched.value, request_id).await {
        HandlerOutcome::Dispatched => {
            Ok(await_response(rx, &shared, request_id).await.into_hyper())
        }
        HandlerOutcome::Unknown => {
            error!(request_id, "no handler registered for matched route");
            Ok(Response::internal_error("Handler not registered").into_hyper())
        }
        HandlerOutcome::Failed => Ok(Response::internal_error("Handler failure").into_hyper()),
    }
}

/// Buffer the request body, rejecting anything over the cap with 413
/// before it is fully read.
async fn read_body(
    req: hyper::Request<Incoming>,
    max_body_size: usize,
) -> std::result::Result<std::result::Result<Bytes, Response>, hyper::Error> {
    let declared = req
        .headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|length| length > max_body_size) {
        return Ok(Err(Response::payload_too_large()));
    }

    let mut body = req.into_body();
    let mut collected = Vec::with_capacity(declared.unwrap_or(0).min(64 * 1024));
    while let Some(frame) = body.frame().await {
        let frame = frame?;
        if let Ok(data) = frame.into_data() {
            if collected.len() + data.len() > max_body_size {
                return Ok(Err(Response::payload_too_large()));
            }
            collected.extend_from_slice(&data);
        }
    }
    Ok(Ok(Bytes::from(collected)))
}

/// Wait for the embedder to finish the response, up to the request
/// timeout. A dropped slot answers 500, a timeout answers 504.
async fn await_response(
    rx: tokio::sync::oneshot::Receiver<Response>,
    shared: &Arc<EngineShared>,
    request_id: u64,
) -> Response {
    match tokio::time::timeout(shared.config.request_timeout, rx).await {
        Ok(Ok(response)) => response,
        Ok(Err(_)) => {
            error!(request_id, "request slot dropped before a response was sent");
            Response::internal_error("Request aborted")
        }
        Err(_) => {
            warn!(request_id, "no response within the request timeout");
            Response::gateway_timeout()
        }
    }
}

/// Removes the request slot when the pipeline exits, including when the
/// connection task is cancelled mid-request.
struct RequestGuard<'a> {
    registry: &'a RequestRegistry,
    request_id: u64,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.request_id);
    }
}
