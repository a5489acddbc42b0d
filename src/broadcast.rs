//! Per-project event fan-out
//!
//! `Broadcaster` keeps the set of currently attached subscriber handles for
//! each project and delivers every published envelope to all of them in one
//! synchronous pass. Delivery is best-effort and non-durable: a subscriber
//! not attached at publish time never receives that event and reconciles
//! through REST backfill instead. The broadcaster is an explicitly
//! constructed instance, injected into whatever publishes or subscribes,
//! never process-global state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};

use crate::types::EventEnvelope;

/// Identifier for one attached subscriber handle
pub type SubscriberId = u64;

/// In-memory, single-instance fan-out registry
#[derive(Default)]
pub struct Broadcaster {
    subscribers:
        RwLock<HashMap<String, HashMap<SubscriberId, mpsc::UnboundedSender<EventEnvelope>>>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber to a project's event feed
    pub async fn subscribe(
        &self,
        project_id: &str,
    ) -> (SubscriberId, mpsc::UnboundedReceiver<EventEnvelope>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subs = self.subscribers.write().await;
        subs.entry(project_id.to_string()).or_default().insert(id, tx);

        tracing::debug!(project = %project_id, subscriber = id, "subscriber attached");
        (id, rx)
    }

    /// Detach a subscriber; other subscribers are unaffected
    pub async fn unsubscribe(&self, project_id: &str, id: SubscriberId) {
        let mut subs = self.subscribers.write().await;
        if let Some(handles) = subs.get_mut(project_id) {
            handles.remove(&id);
            if handles.is_empty() {
                subs.remove(project_id);
            }
        }
        tracing::debug!(project = %project_id, subscriber = id, "subscriber detached");
    }

    /// Deliver an envelope to every currently attached subscriber
    ///
    /// All subscribers observe publishes in the same relative order (single
    /// pass per publish). Handles whose receiver is gone are pruned. Returns
    /// the number of subscribers reached.
    pub async fn publish(&self, project_id: &str, envelope: EventEnvelope) -> usize {
        let mut subs = self.subscribers.write().await;
        let Some(handles) = subs.get_mut(project_id) else {
            return 0;
        };

        let mut delivered = 0;
        handles.retain(|id, tx| {
            if tx.send(envelope.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                tracing::debug!(project = %project_id, subscriber = id, "pruning dead subscriber");
                false
            }
        });

        if handles.is_empty() {
            subs.remove(project_id);
        }
        delivered
    }

    /// Number of handles currently attached for a project
    pub async fn subscriber_count(&self, project_id: &str) -> usize {
        let subs = self.subscribers.read().await;
        subs.get(project_id).map_or(0, HashMap::len)
    }
}
