//! In-flight request registry
//!
//! Correlates boundary callbacks with live requests. Each request gets a
//! process-unique id from an atomic counter; the connection task parks on a
//! oneshot receiver while the embedder mutates pending response state
//! through the id. Exactly one terminal send wins; everything after that is
//! `ResponseAlreadySent`. A context disappears when its response is handed
//! to the connection task or when the owning connection dies, so reads on a
//! finished id simply miss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::request::RequestData;
use crate::response::{Response, StatusCode};

struct ResponseState {
    headers: Vec<(String, String)>,
    sent: bool,
    completion: Option<oneshot::Sender<Response>>,
}

/// One live request: immutable parsed data plus mutable response state.
pub(crate) struct RequestSlot {
    pub data: RequestData,
    response: Mutex<ResponseState>,
}

impl RequestSlot {
    /// Append a pending response header. Append-only; duplicates are
    /// preserved in order.
    pub fn append_header(&self, name: &str, value: &str) -> Result<()> {
        let mut state = self.response.lock();
        if state.sent {
            return Err(Error::ResponseAlreadySent {
                request_id: self.data.id,
            });
        }
        state.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Terminal send. Builds the final response from the pending headers,
    /// marks the slot sent, and wakes the connection task. Fails with
    /// `ResponseAlreadySent` on any attempt after the first.
    pub fn finish(&self, status: u16, content_type: &str, body: Bytes) -> Result<()> {
        let mut state = self.response.lock();
        if state.sent {
            return Err(Error::ResponseAlreadySent {
                request_id: self.data.id,
            });
        }
        state.sent = true;

        let mut response = Response::new(StatusCode(status));
        for (name, value) in state.headers.drain(..) {
            response.append_header(name, value);
        }
        if !content_type.is_empty() {
            response.append_header("Content-Type", content_type);
        }
        response.body = body;

        if let Some(completion) = state.completion.take() {
            if completion.send(response).is_err() {
                debug!(
                    request_id = self.data.id,
                    "connection closed before response could be flushed"
                );
            }
        }
        Ok(())
    }
}

/// Registry of all in-flight requests across all servers.
pub(crate) struct RequestRegistry {
    next_id: AtomicU64,
    slots: RwLock<HashMap<u64, Arc<RequestSlot>>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            // 0 is reserved so an uninitialized id never matches
            next_id: AtomicU64::new(1),
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Next monotonic request id.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a parsed request and get the receiver its connection task
    /// awaits for the terminal response.
    pub fn insert(&self, data: RequestData) -> oneshot::Receiver<Response> {
        let (completion_tx, completion_rx) = oneshot::channel();
        let id = data.id;
        let slot = Arc::new(RequestSlot {
            data,
            response: Mutex::new(ResponseState {
                headers: Vec::new(),
                sent: false,
                completion: Some(completion_tx),
            }),
        });
        self.slots.write().insert(id, slot);
        completion_rx
    }

    pub fn get(&self, id: u64) -> Option<Arc<RequestSlot>> {
        self.slots.read().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<RequestSlot>> {
        self.slots.write().remove(&id)
    }

    /// Drop every slot belonging to `server`. Completion senders go with
    /// the slots, so parked connection tasks see the channel close.
    pub fn remove_for_server(&self, server: Handle) -> usize {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, slot| slot.data.server != server);
        before - slots.len()
    }
}
