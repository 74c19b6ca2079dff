//! WebSocket hub: endpoints, connections, and message delivery.
//!
//! An endpoint is a path-bound upgrade target owned by one server.
//! Requests that match the path and carry a websocket upgrade are
//! promoted off the HTTP pipeline: the handshake answers 101, the
//! connection is registered under a fresh client id, and a read task
//! feeds inbound text messages to the dispatcher until the peer hangs
//! up or the server forces the connection closed.
//!
//! Writes to one connection are serialized by a per-connection lock.
//! Broadcast walks a point-in-time snapshot and never lets one dead
//! connection stall the rest; a connection's closed callback fires
//! exactly once no matter which side ended it.

pub mod frame;
pub mod handshake;

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::codec::generate_uuid;
use crate::dispatch::DispatcherSlot;
use crate::error::{Error, Result};
use crate::handle::Handle;

use frame::{Frame, Opcode, MAX_FRAME_SIZE};

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One upgraded connection. The writer lock serializes frames from
/// unicast, broadcast, and control replies; `open` flips exactly once.
pub(crate) struct WsConnection {
    pub client_id: String,
    writer: AsyncMutex<BoxedWriter>,
    open: AtomicBool,
}

impl WsConnection {
    pub fn new(client_id: String, writer: BoxedWriter) -> Self {
        Self {
            client_id,
            writer: AsyncMutex::new(writer),
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Flip to closed. Returns true for the one caller that did the
    /// flip; that caller owns the closed notification.
    pub fn mark_closed(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }

    pub async fn send_frame(&self, frame: &Frame) -> io::Result<()> {
        self.send_raw(&frame.encode()).await
    }

    pub async fn send_raw(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }
}

/// A path-bound upgrade target and the set of connections behind it.
pub(crate) struct WsEndpoint {
    pub server: Handle,
    pub path: String,
    handle: OnceLock<Handle>,
    connections: RwLock<HashMap<String, Arc<WsConnection>>>,
}

impl WsEndpoint {
    pub fn new(server: Handle, path: String) -> Arc<Self> {
        Arc::new(Self {
            server,
            path,
            handle: OnceLock::new(),
            connections: RwLock::new(HashMap::new()),
        })
    }

    /// Record the endpoint's own handle once the table has issued it.
    pub fn set_handle(&self, handle: Handle) {
        let _ = self.handle.set(handle);
    }

    pub fn handle(&self) -> Handle {
        self.handle.get().copied().unwrap_or(Handle::INVALID)
    }

    pub fn client_count(&self) -> usize {
        self.connections.read().len()
    }

    fn insert(&self, conn: Arc<WsConnection>) {
        self.connections
            .write()
            .insert(conn.client_id.clone(), conn);
    }

    fn remove(&self, client_id: &str) -> Option<Arc<WsConnection>> {
        self.connections.write().remove(client_id)
    }

    fn get(&self, client_id: &str) -> Option<Arc<WsConnection>> {
        self.connections.read().get(client_id).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<WsConnection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Deliver a text message to one client.
    ///
    /// Unknown or already-closed ids report [`Error::UnknownWebSocketClient`].
    /// A transport failure evicts the connection and surfaces the I/O error.
    pub async fn send_text(
        self: &Arc<Self>,
        dispatcher: &DispatcherSlot,
        client_id: &str,
        message: &str,
    ) -> Result<()> {
        let conn = self
            .get(client_id)
            .filter(|conn| conn.is_open())
            .ok_or_else(|| Error::UnknownWebSocketClient {
                client_id: client_id.to_string(),
            })?;

        if let Err(error) = conn.send_frame(&Frame::text(message)).await {
            warn!(client_id, %error, "websocket send failed, evicting client");
            evict(self, &conn, dispatcher).await;
            return Err(Error::Io(error));
        }
        Ok(())
    }

    /// Deliver a text message to every connection open at the time of
    /// the call. Returns how many deliveries were started. Each delivery
    /// runs as its own task; a failed write evicts that one connection
    /// and the others never wait on it.
    pub async fn broadcast_text(self: &Arc<Self>, dispatcher: &DispatcherSlot, message: &str) -> usize {
        let targets = self.snapshot();
        let bytes: Arc<[u8]> = Frame::text(message).encode().into();
        let mut count = 0;

        for conn in targets {
            if !conn.is_open() {
                continue;
            }
            count += 1;
            let endpoint = Arc::clone(self);
            let dispatcher = dispatcher.clone();
            let bytes = Arc::clone(&bytes);
            tokio::spawn(async move {
                if let Err(error) = conn.send_raw(&bytes).await {
                    debug!(
                        client_id = %conn.client_id,
                        %error,
                        "broadcast delivery failed, evicting client"
                    );
                    evict(&endpoint, &conn, &dispatcher).await;
                }
            });
        }

        count
    }

    /// Close one client's transport and drop it from the set. Unknown
    /// and already-closed ids are a no-op.
    pub async fn close_client(self: &Arc<Self>, dispatcher: &DispatcherSlot, client_id: &str) {
        let Some(conn) = self.remove(client_id) else {
            return;
        };
        let _ = conn.send_frame(&Frame::close(1000, "")).await;
        if conn.mark_closed() {
            info!(endpoint = %self.handle(), client_id, "websocket client closed");
            notify_closed(dispatcher, self.handle(), conn.client_id.clone()).await;
        }
    }

    /// Close every connection on the endpoint. Used at server teardown.
    pub async fn close_all(self: &Arc<Self>, dispatcher: &DispatcherSlot) {
        let drained: Vec<Arc<WsConnection>> = {
            let mut connections = self.connections.write();
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained {
            let _ = conn.send_frame(&Frame::close(1001, "server shutting down")).await;
            if conn.mark_closed() {
                notify_closed(dispatcher, self.handle(), conn.client_id.clone()).await;
            }
        }
    }
}

/// Validate the handshake, spawn the connection task, and produce the
/// 101 response hyper needs to flush before handing over the socket.
pub(crate) fn try_upgrade(
    endpoint: Arc<WsEndpoint>,
    dispatcher: DispatcherSlot,
    req: &mut hyper::Request<Incoming>,
    force_close: watch::Receiver<bool>,
) -> Result<hyper::Response<Full<Bytes>>> {
    let headers = req.headers();

    if let Some(version) = headers.get(http::header::SEC_WEBSOCKET_VERSION) {
        if version.to_str().ok().map(str::trim) != Some("13") {
            return Err(Error::UpgradeFailed(format!(
                "unsupported websocket version {:?}",
                version
            )));
        }
    }

    let key = headers
        .get(http::header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::UpgradeFailed("missing Sec-WebSocket-Key".to_string()))?;

    let accept = handshake::accept_key(key.trim());
    let accept_value = http::HeaderValue::from_str(&accept)
        .map_err(|_| Error::UpgradeFailed("malformed Sec-WebSocket-Key".to_string()))?;

    let upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(upgraded) => upgraded,
            Err(error) => {
                warn!(%error, "websocket upgrade did not complete");
                return;
            }
        };

        let (reader, writer) = tokio::io::split(TokioIo::new(upgraded));
        let client_id = generate_uuid();
        let conn = Arc::new(WsConnection::new(client_id.clone(), Box::new(writer)));
        endpoint.insert(Arc::clone(&conn));
        info!(
            server = %endpoint.server,
            path = %endpoint.path,
            client_id = %client_id,
            "websocket client connected"
        );

        notify_opened(&dispatcher, endpoint.handle(), client_id).await;
        read_loop(endpoint, conn, reader, dispatcher, force_close).await;
    });

    let mut response = hyper::Response::new(Full::new(Bytes::new()));
    *response.status_mut() = hyper::StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(http::header::UPGRADE, http::HeaderValue::from_static("websocket"));
    headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("Upgrade"));
    headers.insert(http::header::SEC_WEBSOCKET_ACCEPT, accept_value);
    Ok(response)
}

/// Drive one connection: decode frames, answer pings, reassemble
/// fragmented text, and hand complete messages to the dispatcher.
/// Exits on peer close, transport failure, protocol error, or a forced
/// close from server shutdown, then evicts the connection.
pub(crate) async fn read_loop(
    endpoint: Arc<WsEndpoint>,
    conn: Arc<WsConnection>,
    mut reader: impl AsyncRead + Send + Unpin,
    dispatcher: DispatcherSlot,
    mut force_close: watch::Receiver<bool>,
) {
    let mut buf = BytesMut::with_capacity(4096);
    let mut fragments: Vec<u8> = Vec::new();
    let mut fragment_kind: Option<Opcode> = None;

    'conn: loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break 'conn,
                    Ok(_) => {}
                    Err(error) => {
                        debug!(client_id = %conn.client_id, %error, "websocket read failed");
                        break 'conn;
                    }
                }
            }
            changed = force_close.changed() => {
                if changed.is_err() || *force_close.borrow_and_update() {
                    break 'conn;
                }
                continue;
            }
        }

        loop {
            let frame = match Frame::decode(&mut buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(error) => {
                    warn!(client_id = %conn.client_id, %error, "websocket protocol error");
                    let _ = conn.send_frame(&Frame::close(1002, "protocol error")).await;
                    break 'conn;
                }
            };

            match frame.opcode {
                Opcode::Text | Opcode::Binary => {
                    if frame.fin {
                        if frame.opcode == Opcode::Text {
                            let text = String::from_utf8_lossy(&frame.payload).into_owned();
                            notify_message(&dispatcher, &endpoint, &conn, text).await;
                        }
                        // Binary payloads are read and dropped; the
                        // dispatch surface is text messages.
                    } else {
                        fragment_kind = Some(frame.opcode);
                        fragments = frame.payload;
                    }
                }
                Opcode::Continuation => {
                    if fragments.len() + frame.payload.len() > MAX_FRAME_SIZE {
                        let _ = conn.send_frame(&Frame::close(1009, "message too big")).await;
                        break 'conn;
                    }
                    fragments.extend_from_slice(&frame.payload);
                    if frame.fin {
                        if fragment_kind == Some(Opcode::Text) {
                            let text = String::from_utf8_lossy(&fragments).into_owned();
                            notify_message(&dispatcher, &endpoint, &conn, text).await;
                        }
                        fragments = Vec::new();
                        fragment_kind = None;
                    }
                }
                Opcode::Ping => {
                    if conn.send_frame(&Frame::pong(frame.payload)).await.is_err() {
                        break 'conn;
                    }
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    let code = frame.close_code().unwrap_or(1000);
                    let _ = conn.send_frame(&Frame::close(code, "")).await;
                    break 'conn;
                }
            }
        }
    }

    evict(&endpoint, &conn, &dispatcher).await;
}

/// Drop a connection from its endpoint and fire the closed callback if
/// this is the first time anyone closed it.
async fn evict(endpoint: &Arc<WsEndpoint>, conn: &Arc<WsConnection>, dispatcher: &DispatcherSlot) {
    endpoint.remove(&conn.client_id);
    if conn.mark_closed() {
        info!(
            endpoint = %endpoint.handle(),
            client_id = %conn.client_id,
            "websocket client disconnected"
        );
        notify_closed(dispatcher, endpoint.handle(), conn.client_id.clone()).await;
    }
}

async fn notify_opened(dispatcher: &DispatcherSlot, endpoint: Handle, client_id: String) {
    let Some(dispatcher) = dispatcher.get() else {
        return;
    };
    let result =
        tokio::task::spawn_blocking(move || dispatcher.websocket_opened(endpoint, &client_id))
            .await;
    if let Err(join_error) = result {
        error!(error = %join_error, "websocket opened callback panicked");
    }
}

async fn notify_message(
    dispatcher: &DispatcherSlot,
    endpoint: &Arc<WsEndpoint>,
    conn: &Arc<WsConnection>,
    message: String,
) {
    let Some(dispatcher) = dispatcher.get() else {
        return;
    };
    let handle = endpoint.handle();
    let client_id = conn.client_id.clone();
    let result = tokio::task::spawn_blocking(move || {
        dispatcher.websocket_message(handle, &client_id, &message)
    })
    .await;
    if let Err(join_error) = result {
        error!(error = %join_error, "websocket message callback panicked");
    }
}

async fn notify_closed(dispatcher: &DispatcherSlot, endpoint: Handle, client_id: String) {
    let Some(dispatcher) = dispatcher.get() else {
        return;
    };
    let result =
        tokio::task::spawn_blocking(move || dispatcher.websocket_closed(endpoint, &client_id))
            .await;
    if let Err(join_error) = result {
        error!(error = %join_error, "websocket closed callback panicked");
    }
}
