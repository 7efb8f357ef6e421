pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use flowline_core::config::{AppConfig, StorageBackend};
use flowline_core::error::Result;
use flowline_core::traits::SessionStore;

/// Open the store selected by `[storage]`.
pub fn open_store(config: &AppConfig) -> Result<Arc<dyn SessionStore>> {
    Ok(match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Sqlite => Arc::new(SqliteStore::open(&config.storage_path())?),
    })
}
