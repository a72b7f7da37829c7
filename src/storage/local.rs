//! localStorage-backed store
//!
//! Values are base64-encoded because localStorage only holds strings. Keys
//! are namespaced so the client can coexist with other page state.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};

use super::Storage;
use crate::error::{Result, TorError};

const KEY_PREFIX: &str = "snowtor:";

pub struct LocalStorage {
    store: web_sys::Storage,
}

impl LocalStorage {
    pub fn new() -> Result<Self> {
        let window = web_sys::window()
            .ok_or_else(|| TorError::Storage("no window object".into()))?;
        let store = window
            .local_storage()
            .map_err(|_| TorError::Storage("localStorage access denied".into()))?
            .ok_or_else(|| TorError::Storage("localStorage not available".into()))?;
        Ok(Self { store })
    }

    fn full_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }
}

#[async_trait(?Send)]
impl Storage for LocalStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let raw = self
            .store
            .get_item(&Self::full_key(key))
            .map_err(|_| TorError::Storage(format!("get failed for {}", key)))?;

        match raw {
            Some(encoded) => {
                let bytes = general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| TorError::Storage(format!("corrupt entry {}: {}", key, e)))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let encoded = general_purpose::STANDARD.encode(value);
        self.store
            .set_item(&Self::full_key(key), &encoded)
            .map_err(|_| TorError::Storage(format!("set failed for {} (quota?)", key)))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.store
            .remove_item(&Self::full_key(key))
            .map_err(|_| TorError::Storage(format!("remove failed for {}", key)))
    }
}
