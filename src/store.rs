//! Store handle: the public surface of the persistence layer.
//!
//! One handle owns the two collections, the subscriber registry, and the
//! continuous watch over the action log. The handle moves through
//! `Unconnected -> Connected -> Closed`; `Closed` is terminal and every
//! operation after it fails with [`StoreError::NotConnected`].
//!
//! All coordination between concurrent writers happens inside the storage
//! engine: stream creation and action appends ride on the unique-key insert,
//! snapshot saves on the sequence-number conditional replace. The store never
//! takes a client-side lock around storage I/O.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::document::{from_document, to_document, Action, Snapshot, SnapshotMeta};
use crate::feed::{self, LiveFeed};
use crate::interfaces::{DocumentCollection, MatchPredicate, StorageError, WatchFilter};
use crate::keys::{derive_action_key, derive_key, StreamId};
use crate::storage::init_storage;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Stream already exists: {stream_id}")]
    AlreadyExists { stream_id: StreamId },

    #[error("No snapshot for stream {stream_id}")]
    SnapshotNotFound { stream_id: StreamId },

    #[error("No action for stream {stream_id} at sequence {sequence_number}")]
    ActionNotFound {
        stream_id: StreamId,
        sequence_number: u64,
    },

    #[error(
        "Snapshot save rejected for stream {stream_id}: stored sequence is not {sequence_number} - 1"
    )]
    ConcurrencyConflict {
        stream_id: StreamId,
        sequence_number: u64,
    },

    #[error("Sequence {sequence_number} already written for stream {stream_id}")]
    DuplicateSequence {
        stream_id: StreamId,
        sequence_number: u64,
    },

    #[error("Store is not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Record encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Lifecycle of a store handle.
enum State {
    Unconnected,
    Connected(Connected),
    Closed,
}

/// Resources held while connected.
#[derive(Clone)]
struct Connected {
    actions: Arc<dyn DocumentCollection>,
    snapshots: Arc<dyn DocumentCollection>,
    watch_task: Arc<JoinHandle<()>>,
}

/// Event-sourced stream store.
pub struct Store {
    config: Config,
    state: RwLock<State>,
    live: Arc<LiveFeed>,
}

impl Store {
    /// Create an unconnected handle with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: RwLock::new(State::Unconnected),
            live: Arc::new(LiveFeed::new()),
        }
    }

    /// Establish the collections and start the watch over the action log.
    ///
    /// Connecting an already connected handle is a no-op; connecting a closed
    /// handle fails with [`StoreError::NotConnected`].
    #[instrument(name = "store.connect", skip_all)]
    pub async fn connect(&self) -> Result<()> {
        {
            let state = self.state.read();
            match &*state {
                State::Unconnected => {}
                State::Connected(_) => return Ok(()),
                State::Closed => return Err(StoreError::NotConnected),
            }
        }

        let (actions, snapshots) = init_storage(&self.config.storage)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        // The watch starts now: only actions committed after this instant
        // reach subscribers. Earlier history stays readable via get_action.
        let watch = actions
            .watch(WatchFilter::starting_now())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let watch_task = feed::spawn_consumer(Arc::clone(&self.live), watch);

        let mut state = self.state.write();
        if matches!(&*state, State::Connected(_)) {
            // Lost a connect race: discard our watch.
            watch_task.abort();
            return Ok(());
        }
        if matches!(&*state, State::Closed) {
            watch_task.abort();
            return Err(StoreError::NotConnected);
        }

        *state = State::Connected(Connected {
            actions,
            snapshots,
            watch_task: Arc::new(watch_task),
        });
        info!("Tail store connected");
        Ok(())
    }

    /// Release the watch and drop every subscriber. Idempotent; the handle
    /// cannot be reconnected. In-flight operations complete naturally.
    pub fn close(&self) {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, State::Closed)
        };

        if let State::Connected(connected) = previous {
            connected.watch_task.abort();
            self.live.clear();
            info!("Tail store closed");
        }
    }

    /// Clone the connected resources out of the state lock, so storage I/O
    /// never serializes behind it.
    fn connected(&self) -> Result<Connected> {
        match &*self.state.read() {
            State::Connected(connected) => Ok(connected.clone()),
            _ => Err(StoreError::NotConnected),
        }
    }

    /// Create a stream with an initial snapshot at sequence number zero.
    ///
    /// Creation is a bare insert: the engine's unique-key constraint makes it
    /// atomic, so of two concurrent creators exactly one wins.
    #[instrument(name = "store.create_stream", skip_all, fields(stream = %stream_id))]
    pub async fn create_stream(
        &self,
        stream_id: StreamId,
        initial_state: Map<String, Value>,
    ) -> Result<()> {
        let connected = self.connected()?;
        let key = derive_key(&stream_id);

        let snapshot = Snapshot {
            meta: SnapshotMeta {
                stream_id: stream_id.clone(),
                sequence_number: 0,
            },
            state: initial_state,
        };
        let document = to_document(&snapshot, &key)?;

        match connected.snapshots.insert_one(document).await {
            Ok(()) => {
                debug!(key = %key, "Stream created");
                Ok(())
            }
            Err(StorageError::DuplicateKey(_)) => Err(StoreError::AlreadyExists { stream_id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the latest snapshot for a stream.
    pub async fn get_snapshot(&self, stream_id: &StreamId) -> Result<Snapshot> {
        let connected = self.connected()?;
        let key = derive_key(stream_id);

        let document = connected.snapshots.find_one(&key).await?.ok_or_else(|| {
            StoreError::SnapshotNotFound {
                stream_id: stream_id.clone(),
            }
        })?;

        Ok(from_document(&document)?)
    }

    /// Replace a stream's snapshot under the sequence-number
    /// compare-and-swap.
    ///
    /// The caller supplies the next sequence number; the replace matches only
    /// if the stored snapshot is at exactly one less. Zero affected documents
    /// means the check failed and the caller re-reads and retries, since only
    /// the caller knows how to recompute its state.
    #[instrument(
        name = "store.save_snapshot",
        skip_all,
        fields(stream = %snapshot.meta.stream_id, sequence = snapshot.meta.sequence_number)
    )]
    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let connected = self.connected()?;
        let meta = &snapshot.meta;

        // Sequence zero is only ever written by create_stream; there is no
        // prior sequence for the swap to match.
        let Some(prior) = meta.sequence_number.checked_sub(1) else {
            return Err(StoreError::ConcurrencyConflict {
                stream_id: meta.stream_id.clone(),
                sequence_number: meta.sequence_number,
            });
        };

        let key = derive_key(&meta.stream_id);
        let document = to_document(snapshot, &key)?;

        let affected = connected
            .snapshots
            .update_one(MatchPredicate::key_at_sequence(key, prior), document)
            .await?;
        if affected == 0 {
            return Err(StoreError::ConcurrencyConflict {
                stream_id: meta.stream_id.clone(),
                sequence_number: meta.sequence_number,
            });
        }

        Ok(())
    }

    /// Delete a stream's snapshot.
    ///
    /// Known gap: the stream's actions are left in place, so re-creating a
    /// deleted stream collides with the orphaned sequence numbers.
    pub async fn delete_stream(&self, stream_id: &StreamId) -> Result<()> {
        let connected = self.connected()?;
        let key = derive_key(stream_id);

        connected.snapshots.delete_one(&key).await?;
        debug!(key = %key, "Stream deleted");
        Ok(())
    }

    /// Append one action to its stream's log.
    ///
    /// Sequence numbers are caller-assigned and unique per stream: of two
    /// concurrent appends for the same number exactly one insert wins, the
    /// other fails with [`StoreError::DuplicateSequence`]. Picking the next
    /// number after a conflict is the caller's loop.
    #[instrument(
        name = "store.save_action",
        skip_all,
        fields(stream = %action.meta.stream_id, sequence = action.meta.sequence_number)
    )]
    pub async fn save_action(&self, action: &Action) -> Result<()> {
        let connected = self.connected()?;
        let meta = &action.meta;
        let key = derive_action_key(&meta.stream_id, meta.sequence_number);

        let document = to_document(action, &key)?;

        match connected.actions.insert_one(document).await {
            Ok(()) => Ok(()),
            Err(StorageError::DuplicateKey(_)) => Err(StoreError::DuplicateSequence {
                stream_id: meta.stream_id.clone(),
                sequence_number: meta.sequence_number,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one action by stream and sequence number.
    pub async fn get_action(&self, stream_id: &StreamId, sequence_number: u64) -> Result<Action> {
        let connected = self.connected()?;
        let key = derive_action_key(stream_id, sequence_number);

        let document = connected.actions.find_one(&key).await?.ok_or_else(|| {
            StoreError::ActionNotFound {
                stream_id: stream_id.clone(),
                sequence_number,
            }
        })?;

        Ok(from_document(&document)?)
    }

    /// Register a subscriber for every future action from every stream.
    ///
    /// Registration is synchronous; delivery happens on the watch consumer
    /// in arrival order. Subscribers live until the handle is closed.
    pub fn on_new_action(&self, callback: impl Fn(Action) + Send + Sync + 'static) -> Result<()> {
        self.connected()?;
        self.live.subscribe_global(Box::new(callback));
        Ok(())
    }

    /// Register a subscriber for future actions of one stream.
    pub fn on_new_action_from_stream(
        &self,
        stream_id: &StreamId,
        callback: impl Fn(Action) + Send + Sync + 'static,
    ) -> Result<()> {
        self.connected()?;
        self.live.subscribe_stream(stream_id, Box::new(callback));
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.close();
    }
}
