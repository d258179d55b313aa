//! Tailstore - event-sourced stream persistence.
//!
//! An append-only log of actions per logical stream, a compare-and-swap
//! guarded snapshot of derived state per stream, and a live feed that tails
//! the action log and republishes each newly committed action to in-process
//! subscribers.
//!
//! The storage engine is an abstract collaborator (see
//! [`interfaces::DocumentCollection`]); an in-memory engine ships with the
//! crate.

pub mod config;
pub mod document;
pub mod feed;
pub mod interfaces;
pub mod keys;
pub mod storage;
pub mod store;

pub use config::{Config, StorageConfig, StorageType};
pub use document::{censor, Action, ActionMeta, Document, Snapshot, SnapshotMeta};
pub use feed::LiveFeed;
pub use interfaces::{DocumentCollection, DocumentStream, MatchPredicate, StorageError, WatchFilter};
pub use keys::{derive_action_key, derive_key, StorageKey, StreamId};
pub use store::{Store, StoreError};
