//! Middleware chain
//!
//! An ordered list of middleware names, appended by `use_middleware` and
//! never removed. Dispatch takes a point-in-time snapshot of the list, so
//! a concurrent append is only visible to requests that enter the chain
//! afterwards. Each name resolves on the embedding side and answers
//! continue or short-circuit; short-circuit means a terminal response was
//! already produced for the request.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::dispatch::{self, Dispatcher, MiddlewareDecision};

/// Registration-ordered middleware names for one server.
pub(crate) struct MiddlewareChain {
    names: RwLock<Vec<String>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            names: RwLock::new(Vec::new()),
        }
    }

    pub fn append(&self, name: &str) {
        self.names.write().push(name.to_string());
    }

    /// The chain as seen by a request entering dispatch right now.
    pub fn snapshot(&self) -> Vec<String> {
        self.names.read().clone()
    }
}

/// How a request left the middleware chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainOutcome {
    /// Every hook continued; proceed to the route handler.
    Completed,
    /// A hook produced the response; skip the handler and await it.
    ShortCircuited,
    /// A hook panicked; the server answers 500.
    Failed,
}

/// Run a snapshot of the chain for one request, stopping at the first
/// short-circuit. With no dispatcher installed the chain is skipped.
pub(crate) async fn run_chain(
    dispatcher: Option<Arc<dyn Dispatcher>>,
    names: Vec<String>,
    request_id: u64,
) -> ChainOutcome {
    let Some(dispatcher) = dispatcher else {
        return ChainOutcome::Completed;
    };
    for name in names {
        debug!(request_id, middleware = %name, "running middleware");
        match dispatch::invoke_middleware(dispatcher.clone(), name, request_id).await {
            Some(MiddlewareDecision::Continue) => continue,
            Some(MiddlewareDecision::ShortCircuit) => return ChainOutcome::ShortCircuited,
            None => return ChainOutcome::Failed,
        }
    }
    ChainOutcome::Completed
}
