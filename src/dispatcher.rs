//! Response Dispatcher (spec §4.E): a token-keyed handler registry with
//! FIFO-per-handler delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::request::types::Request;

/// The terminal, externally visible result of a queued request.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success {
        status_code: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    Failed {
        status_code: Option<u16>,
        error_kind: String,
        body: Option<Vec<u8>>,
    },
    Aborted {
        reason: String,
    },
}

/// A capability registered subscribers implement to observe queue outcomes.
/// Mirrors the `onOutcome` handler interface from spec §6; `on_identifier_merge`
/// is the optional companion mentioned in §9's Design Notes.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn on_outcome(&self, request: &Request, outcome: &Outcome);

    /// Called after a successful creation response triggers an identifier
    /// merge. Default no-op — most handlers only care about `on_outcome`.
    async fn on_identifier_merge(&self, _old_local: &[u8], _new_remote: &[u8]) {}
}

/// Opaque registration handle returned by `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

/// Handler registry. Delivery to a given handler is FIFO and matches request
/// completion order; distinct requests may be delivered to the same handler
/// concurrently but a single request is never delivered twice.
#[derive(Default)]
pub struct Dispatcher {
    next_token: AtomicU64,
    // A per-handler async mutex would serialize deliveries to that handler;
    // holding the registry lock only long enough to clone the handler Arc
    // keeps registration and delivery from blocking each other.
    handlers: Mutex<HashMap<u64, Arc<dyn Handler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handler: Arc<dyn Handler>) -> HandlerToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().await.insert(token, handler);
        HandlerToken(token)
    }

    pub async fn unregister(&self, token: HandlerToken) {
        self.handlers.lock().await.remove(&token.0);
    }

    /// Deliver an outcome to every registered handler. Every handler
    /// receives every outcome by default; per-handler filtering is left to
    /// the host, per spec §9.
    pub async fn dispatch(&self, request: &Request, outcome: Outcome) {
        let handlers: Vec<Arc<dyn Handler>> = self.handlers.lock().await.values().cloned().collect();
        for handler in handlers {
            handler.on_outcome(request, &outcome).await;
        }
    }

    pub async fn dispatch_identifier_merge(&self, old_local: &[u8], new_remote: &[u8]) {
        let handlers: Vec<Arc<dyn Handler>> = self.handlers.lock().await.values().cloned().collect();
        for handler in handlers {
            handler.on_identifier_merge(old_local, new_remote).await;
        }
    }
}
