//! Live feed: tail the action log and republish to in-process subscribers.
//!
//! One continuous watch per connected store handle observes newly committed
//! actions. Every observed document is censored, decoded, and dispatched in
//! arrival order to the global subscribers and to the subscribers scoped to
//! the action's stream key. Delivery is best effort and at most once: an
//! action appended while no watch was active is never redelivered, though it
//! stays readable from the log.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::document::{from_document, Action, Document};
use crate::interfaces::DocumentStream;
use crate::keys::{derive_key, StorageKey, StreamId};

/// Callback invoked with each censored action.
pub type ActionCallback = Box<dyn Fn(Action) + Send + Sync>;

/// In-process subscriber registry owned by a store handle.
///
/// Entries have no persisted identity; they live until the owning handle
/// clears them on close.
#[derive(Default)]
pub struct LiveFeed {
    global: RwLock<Vec<ActionCallback>>,
    by_stream: RwLock<HashMap<StorageKey, Vec<ActionCallback>>>,
}

impl LiveFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for every future action from every stream.
    pub fn subscribe_global(&self, callback: ActionCallback) {
        let mut global = self.global.write();
        global.push(callback);
        debug!(subscribers = global.len(), "Global subscriber registered");
    }

    /// Register a subscriber scoped to one stream's key.
    pub fn subscribe_stream(&self, stream_id: &StreamId, callback: ActionCallback) {
        let key = derive_key(stream_id);
        let mut by_stream = self.by_stream.write();
        let subscribers = by_stream.entry(key.clone()).or_default();
        subscribers.push(callback);
        debug!(stream_key = %key, subscribers = subscribers.len(), "Stream subscriber registered");
    }

    /// Drop every registered subscriber.
    pub fn clear(&self) {
        self.global.write().clear();
        self.by_stream.write().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.global.read().len() + self.by_stream.read().values().map(Vec::len).sum::<usize>()
    }

    /// Censor one observed document and deliver it to matching subscribers.
    fn dispatch(&self, document: &Document) {
        let action: Action = match from_document(document) {
            Ok(action) => action,
            Err(e) => {
                error!(error = %e, "Discarding malformed action from watch");
                return;
            }
        };
        let stream_key = derive_key(&action.meta.stream_id);

        {
            let global = self.global.read();
            for callback in global.iter() {
                deliver(callback, &action);
            }
        }

        let by_stream = self.by_stream.read();
        if let Some(subscribers) = by_stream.get(&stream_key) {
            for callback in subscribers {
                deliver(callback, &action);
            }
        }
    }
}

/// Invoke one subscriber, containing any panic so the remaining subscribers
/// and the watch itself keep going.
fn deliver(callback: &ActionCallback, action: &Action) {
    let delivery = catch_unwind(AssertUnwindSafe(|| callback(action.clone())));
    if delivery.is_err() {
        error!(stream = %action.meta.stream_id, "Subscriber panicked, delivery continues");
    }
}

/// Drain the watch stream into the feed until the stream ends or the task is
/// aborted on close.
pub fn spawn_consumer(feed: Arc<LiveFeed>, mut watch: DocumentStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(document) = watch.next().await {
            feed.dispatch(&document);
        }
        debug!("Watch stream ended, live feed consumer stopping");
    })
}
