//! In-memory store, used in tests and as the fallback when localStorage is
//! unavailable.

use std::cell::RefCell;
use std::collections::HashMap;

use async_trait::async_trait;

use super::Storage;
use crate::error::Result;

#[derive(Default)]
pub struct MemoryStorage {
    entries: RefCell<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

#[async_trait(?Send)]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.borrow_mut().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn set_get_remove_roundtrip() {
        let store = MemoryStorage::new();
        block_on(async {
            store.set("microdesc:abc", b"payload").await.unwrap();
            assert_eq!(store.get("microdesc:abc").await.unwrap(), Some(b"payload".to_vec()));

            store.remove("microdesc:abc").await.unwrap();
            assert_eq!(store.get("microdesc:abc").await.unwrap(), None);
        });
    }
}
