//! Durable key-value storage.
//!
//! The cache snapshot and the favourites queue only need a narrow contract:
//! opaque byte values addressed by `(namespace, key)`. The multi-user
//! document database lives behind this trait; [`FileStore`] and
//! [`MemoryStore`] are the local implementations.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// `Ok(None)` when the key does not exist.
    async fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn write(&self, namespace: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Removing a missing key is not an error.
    async fn remove(&self, namespace: &str, key: &str) -> Result<(), StoreError>;

    /// All keys currently stored in a namespace, in no particular order.
    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError>;
}
