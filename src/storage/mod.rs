//! Storage engines.

use std::sync::Arc;

use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::interfaces::{DocumentCollection, Result};

pub mod memory;

pub use memory::MemoryCollection;

/// Initialize storage based on configuration.
///
/// Returns the (actions, snapshots) collection pair for the configured
/// engine.
pub async fn init_storage(
    config: &StorageConfig,
) -> Result<(Arc<dyn DocumentCollection>, Arc<dyn DocumentCollection>)> {
    match config.engine {
        StorageType::Memory => {
            info!(
                actions = %config.action_collection,
                snapshots = %config.snapshot_collection,
                "Storage: memory"
            );
            let actions = Arc::new(MemoryCollection::new(&config.action_collection));
            let snapshots = Arc::new(MemoryCollection::new(&config.snapshot_collection));
            Ok((actions, snapshots))
        }
    }
}
