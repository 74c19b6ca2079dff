//! External dispatch seam
//!
//! Handler and middleware code lives on the embedding side and crosses the
//! boundary as names: the engine only signals "dispatch handler named X for
//! request Y" or "invoke middleware named Z for request Y" and honors the
//! continue/short-circuit answer. Dispatcher calls are treated as slow,
//! synchronous foreign calls and run on the blocking pool so one stalled
//! handler never starves unrelated connections.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::error;

use crate::handle::Handle;

/// A middleware hook's answer for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareDecision {
    /// Proceed to the next hook, then the route handler.
    Continue,
    /// A response was already produced for this request; skip the rest of
    /// the chain and the handler.
    ShortCircuit,
}

/// Embedding-side registry the engine dispatches into.
///
/// `invoke_handler` returns false when the name is unknown to the
/// embedder; the engine then answers 500 instead of waiting for a
/// response that will never come. The WebSocket notifications default to
/// no-ops for embedders that only serve HTTP.
pub trait Dispatcher: Send + Sync + 'static {
    /// Run the named handler for a live request id. The handler responds
    /// through the response-writer operations keyed by `request_id`.
    fn invoke_handler(&self, handler: &str, request_id: u64) -> bool;

    /// Run the named middleware hook for a live request id.
    fn invoke_middleware(&self, middleware: &str, request_id: u64) -> MiddlewareDecision {
        let _ = (middleware, request_id);
        MiddlewareDecision::Continue
    }

    /// A WebSocket connection finished its handshake.
    fn websocket_opened(&self, endpoint: Handle, client_id: &str) {
        let _ = (endpoint, client_id);
    }

    /// A text message arrived on a WebSocket connection.
    fn websocket_message(&self, endpoint: Handle, client_id: &str, message: &str) {
        let _ = (endpoint, client_id, message);
    }

    /// A WebSocket connection closed, whether by peer, failure, or an
    /// explicit close operation.
    fn websocket_closed(&self, endpoint: Handle, client_id: &str) {
        let _ = (endpoint, client_id);
    }
}

/// Swappable dispatcher slot so the embedder can wire its registry after
/// the engine exists. With nothing installed, handlers answer 500 and
/// middleware is skipped. Clones share the slot, so connection tasks can
/// observe a dispatcher installed after they started.
#[derive(Clone)]
pub(crate) struct DispatcherSlot(Arc<ArcSwap<Option<Arc<dyn Dispatcher>>>>);

impl DispatcherSlot {
    pub fn new() -> Self {
        Self(Arc::new(ArcSwap::from_pointee(None)))
    }

    pub fn set(&self, dispatcher: Arc<dyn Dispatcher>) {
        self.0.store(Arc::new(Some(dispatcher)));
    }

    pub fn get(&self) -> Option<Arc<dyn Dispatcher>> {
        self.0.load().as_ref().clone()
    }
}

/// Result of trying to hand a request to the embedder's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerOutcome {
    /// The embedder accepted the name and will respond through the id.
    Dispatched,
    /// No such handler on the embedding side (or no dispatcher installed).
    Unknown,
    /// The foreign call panicked.
    Failed,
}

pub(crate) async fn invoke_handler(
    dispatcher: Option<Arc<dyn Dispatcher>>,
    handler: String,
    request_id: u64,
) -> HandlerOutcome {
    let Some(dispatcher) = dispatcher else {
        return HandlerOutcome::Unknown;
    };
    let name = handler.clone();
    let result =
        tokio::task::spawn_blocking(move || dispatcher.invoke_handler(&handler, request_id)).await;
    match result {
        Ok(true) => HandlerOutcome::Dispatched,
        Ok(false) => HandlerOutcome::Unknown,
        Err(join_error) => {
            error!(
                request_id,
                handler = %name,
                error = %join_error,
                "handler invocation panicked"
            );
            HandlerOutcome::Failed
        }
    }
}

/// Invoke one middleware hook on the blocking pool. `None` means the
/// foreign call panicked.
pub(crate) async fn invoke_middleware(
    dispatcher: Arc<dyn Dispatcher>,
    middleware: String,
    request_id: u64,
) -> Option<MiddlewareDecision> {
    let name = middleware.clone();
    let result =
        tokio::task::spawn_blocking(move || dispatcher.invoke_middleware(&middleware, request_id))
            .await;
    match result {
        Ok(decision) => Some(decision),
        Err(join_error) => {
            error!(
                request_id,
                middleware = %name,
                error = %join_error,
                "middleware invocation panicked"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording {
        handled: AtomicUsize,
    }

    impl Dispatcher for Recording {
        fn invoke_handler(&self, handler: &str, _request_id: u64) -> bool {
            self.handled.fetch_add(1, Ordering::SeqCst);
            handler == "known"
        }
    }

    struct Panicking;

    impl Dispatcher for Panicking {
        fn invoke_handler(&self, _handler: &str, _request_id: u64) -> bool {
            panic!("boundary blew up");
        }
    }

    #[test]
    fn test_slot_starts_empty() {
        let slot = DispatcherSlot::new();
        assert!(slot.get().is_none());

        slot.set(Arc::new(Recording {
            handled: AtomicUsize::new(0),
        }));
        assert!(slot.get().is_some());
    }

    #[tokio::test]
    async fn test_invoke_handler_outcomes() {
        let dispatcher = Arc::new(Recording {
            handled: AtomicUsize::new(0),
        });

        let outcome = invoke_handler(Some(dispatcher.clone()), "known".to_string(), 1).await;
        assert_eq!(outcome, HandlerOutcome::Dispatched);

        let outcome = invoke_handler(Some(dispatcher.clone()), "missing".to_string(), 2).await;
        assert_eq!(outcome, HandlerOutcome::Unknown);

        let outcome = invoke_handler(None, "known".to_string(), 3).await;
        assert_eq!(outcome, HandlerOutcome::Unknown);

        assert_eq!(dispatcher.handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_panic_is_contained() {
        let outcome = invoke_handler(Some(Arc::new(Panicking)), "any".to_string(), 1).await;
        assert_eq!(outcome, HandlerOutcome::Failed);
    }

    #[tokio::test]
    async fn test_middleware_default_continues() {
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(Recording {
            handled: AtomicUsize::new(0),
        });
        let decision = invoke_middleware(dispatcher, "anything".to_string(), 1).await;
        assert_eq!(decision, Some(MiddlewareDecision::Continue));
    }
}
