//! Abstract interfaces for the storage collaborator.
//!
//! The underlying engine is an external collaborator: anything that can
//! offer atomic keyed inserts, a conditional replace, point reads, and a
//! continuous change feed can sit behind [`DocumentCollection`].

pub mod collection;

pub use collection::{
    DocumentCollection, DocumentStream, MatchPredicate, Result, StorageError, WatchFilter,
};
