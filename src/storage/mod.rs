//! Persistent key→bytes storage
//!
//! The directory caches (microdescriptors, consensus documents) and the TLS
//! root-store cache persist through this interface. The browser build stores
//! values in `localStorage` (base64-encoded); tests use the in-memory store.

mod local;
mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;

use crate::error::Result;

/// Byte-oriented key/value store.
///
/// Implementations are single-writer with concurrent readers; callers
/// serialize mutation themselves (the client is single-threaded).
#[async_trait(?Send)]
pub trait Storage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// Default store for the current environment.
pub fn default_storage() -> std::rc::Rc<dyn Storage> {
    match LocalStorage::new() {
        Ok(store) => std::rc::Rc::new(store),
        Err(e) => {
            log::warn!("localStorage unavailable ({}), caches are in-memory only", e);
            std::rc::Rc::new(MemoryStorage::new())
        }
    }
}
