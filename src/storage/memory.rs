//! In-memory storage engine.
//!
//! Backs tests and standalone use without external dependencies. Real
//! engines plug in behind the same [`DocumentCollection`] trait.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use crate::document::{Document, KEY_FIELD};
use crate::interfaces::{
    DocumentCollection, DocumentStream, MatchPredicate, Result, StorageError, WatchFilter,
};
use crate::keys::StorageKey;

/// Change-feed entries buffered per watcher before lag kicks in.
const FEED_CAPACITY: usize = 1024;

/// In-memory document collection with a broadcast change feed.
pub struct MemoryCollection {
    name: String,
    documents: RwLock<HashMap<StorageKey, Document>>,
    feed: broadcast::Sender<Document>,
    fail_on_insert: RwLock<bool>,
    fail_on_find: RwLock<bool>,
}

impl MemoryCollection {
    pub fn new(name: impl Into<String>) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            name: name.into(),
            documents: RwLock::new(HashMap::new()),
            feed,
            fail_on_insert: RwLock::new(false),
            fail_on_find: RwLock::new(false),
        }
    }

    pub async fn set_fail_on_insert(&self, fail: bool) {
        *self.fail_on_insert.write().await = fail;
    }

    pub async fn set_fail_on_find(&self, fail: bool) {
        *self.fail_on_find.write().await = fail;
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}

/// Read the primary key a document carries.
fn document_key(document: &Document) -> Result<StorageKey> {
    document
        .get(KEY_FIELD)
        .cloned()
        .and_then(|key| serde_json::from_value(key).ok())
        .ok_or(StorageError::MissingKey)
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    async fn insert_one(&self, document: Document) -> Result<()> {
        if *self.fail_on_insert.read().await {
            return Err(StorageError::Connection("injected insert failure".into()));
        }

        let key = document_key(&document)?;

        let mut documents = self.documents.write().await;
        if documents.contains_key(&key) {
            return Err(StorageError::DuplicateKey(key));
        }
        documents.insert(key.clone(), document.clone());

        // Publish while still holding the write lock so the feed observes
        // inserts in commit order. Send only fails when nobody is watching.
        let _ = self.feed.send(document);
        drop(documents);

        debug!(collection = %self.name, key = %key, "Document inserted");
        Ok(())
    }

    async fn update_one(&self, predicate: MatchPredicate, document: Document) -> Result<u64> {
        let mut documents = self.documents.write().await;

        let matched = documents
            .get(&predicate.key)
            .map(|existing| predicate.matches(existing))
            .unwrap_or(false);
        if !matched {
            return Ok(0);
        }

        documents.insert(predicate.key.clone(), document);
        debug!(collection = %self.name, key = %predicate.key, "Document replaced");
        Ok(1)
    }

    async fn find_one(&self, key: &StorageKey) -> Result<Option<Document>> {
        if *self.fail_on_find.read().await {
            return Err(StorageError::Connection("injected find failure".into()));
        }

        let documents = self.documents.read().await;
        Ok(documents.get(key).cloned())
    }

    async fn find(&self, predicate: MatchPredicate) -> Result<Vec<Document>> {
        let documents = self.documents.read().await;
        Ok(documents
            .values()
            .filter(|document| predicate.matches(document))
            .cloned()
            .collect())
    }

    async fn delete_one(&self, key: &StorageKey) -> Result<bool> {
        let mut documents = self.documents.write().await;
        let removed = documents.remove(key).is_some();
        if removed {
            debug!(collection = %self.name, key = %key, "Document deleted");
        }
        Ok(removed)
    }

    async fn watch(&self, filter: WatchFilter) -> Result<DocumentStream> {
        let receiver = self.feed.subscribe();
        let name = self.name.clone();

        let stream = BroadcastStream::new(receiver).filter_map(move |entry| {
            futures::future::ready(match entry {
                Ok(document) => filter.matches(&document).then_some(document),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(collection = %name, skipped, "Watch lagged, change-feed entries dropped");
                    None
                }
            })
        });

        Ok(stream.boxed())
    }
}
