//! Directory client: consensus and microdescriptor fetching
//!
//! Documents are fetched over BEGIN_DIR streams on a circuit supplied by the
//! caller (the builder's transient consensus circuit). The consensus is
//! cached whole until its `valid-until`; microdescriptors are cached
//! individually, keyed by their SHA-256 hash, with a bounded FIFO.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use base64::{engine::general_purpose, Engine as _};

use super::circuit::Circuit;
use super::consensus::{split_microdescs, Consensus, Microdesc, MicrodescHead};
use crate::error::{Result, TorError};
use crate::net::http;
use crate::runtime;
use crate::storage::Storage;

/// Bounded size of the microdescriptor cache (FIFO eviction).
const MICRODESC_CACHE_CAPACITY: usize = 1000;

/// How many past consensus documents to retain in storage.
const CONSENSUS_RETAIN: usize = 5;

const STREAM_OPEN_TIMEOUT_MS: u32 = 10_000;
const DIR_FETCH_TIMEOUT_MS: u32 = 60_000;

const CONSENSUS_PATH: &str = "/tor/status-vote/current/consensus-microdesc";

pub struct Directory {
    storage: Rc<dyn Storage>,
    cached_consensus: RefCell<Option<Rc<Consensus>>>,
    microdescs: RefCell<HashMap<String, Rc<Microdesc>>>,
    /// Insertion order of cached microdescriptors, oldest first
    microdesc_order: RefCell<VecDeque<String>>,
    index_loaded: Cell<bool>,
    capacity: usize,
}

impl Directory {
    pub fn new(storage: Rc<dyn Storage>) -> Self {
        Self {
            storage,
            cached_consensus: RefCell::new(None),
            microdescs: RefCell::new(HashMap::new()),
            microdesc_order: RefCell::new(VecDeque::new()),
            index_loaded: Cell::new(false),
            capacity: MICRODESC_CACHE_CAPACITY,
        }
    }

    #[cfg(test)]
    fn with_capacity(storage: Rc<dyn Storage>, capacity: usize) -> Self {
        let mut dir = Self::new(storage);
        dir.capacity = capacity;
        dir
    }

    /// Current microdesc-flavor consensus, fetched through `circuit` unless
    /// a fresh copy is cached in memory or storage.
    pub async fn get_consensus(&self, circuit: &Circuit) -> Result<Rc<Consensus>> {
        let now_secs = runtime::now_ms() / 1000;

        if let Some(cached) = self.cached_consensus.borrow().as_ref() {
            if cached.is_fresh(now_secs) {
                return Ok(Rc::clone(cached));
            }
        }

        if let Some(stored) = self.load_stored_consensus(now_secs).await {
            let stored = Rc::new(stored);
            *self.cached_consensus.borrow_mut() = Some(Rc::clone(&stored));
            return Ok(stored);
        }

        log::info!("fetching consensus through circuit {:#010x}", circuit.id());
        let text = self.fetch_document(circuit, CONSENSUS_PATH).await?;
        let consensus = Consensus::parse(&text)?;

        if let Err(e) = self.store_consensus(&text, consensus.valid_until).await {
            log::warn!("failed to cache consensus: {}", e);
        }

        let consensus = Rc::new(consensus);
        *self.cached_consensus.borrow_mut() = Some(Rc::clone(&consensus));
        Ok(consensus)
    }

    /// Fetch the microdescriptors for `heads`, serving from cache where
    /// possible. Results are returned in the same order as the request.
    pub async fn get_microdescs(
        &self,
        circuit: &Circuit,
        heads: &[MicrodescHead],
    ) -> Result<Vec<Rc<Microdesc>>> {
        self.ensure_index_loaded().await;

        let mut missing = Vec::new();
        for head in heads {
            let key = hex::encode(head.microdesc_hash);
            if self.lookup_cached(&key).await.is_none() {
                missing.push(head);
            }
        }

        if !missing.is_empty() {
            log::debug!("fetching {} microdescriptors", missing.len());
            let digests: Vec<String> = missing
                .iter()
                .map(|h| general_purpose::STANDARD_NO_PAD.encode(h.microdesc_hash))
                .collect();
            let path = format!("/tor/micro/d/{}", digests.join("-"));
            let text = self.fetch_document(circuit, &path).await?;

            let mut fetched: HashMap<[u8; 32], String> = HashMap::new();
            for body in split_microdescs(&text) {
                fetched.insert(Microdesc::digest(&body), body);
            }

            for head in missing {
                let body = fetched
                    .get(&head.microdesc_hash)
                    .ok_or(TorError::MicrodescHashMismatch)?;
                let md = Rc::new(Microdesc::parse(body)?);
                self.insert_cached(hex::encode(head.microdesc_hash), md)
                    .await;
            }
        }

        let mut out = Vec::with_capacity(heads.len());
        for head in heads {
            let key = hex::encode(head.microdesc_hash);
            out.push(
                self.lookup_cached(&key)
                    .await
                    .ok_or(TorError::MicrodescHashMismatch)?,
            );
        }
        Ok(out)
    }

    /// Single-descriptor convenience over [`get_microdescs`].
    pub async fn get_microdesc(
        &self,
        circuit: &Circuit,
        head: &MicrodescHead,
    ) -> Result<Rc<Microdesc>> {
        let mut fetched = self
            .get_microdescs(circuit, std::slice::from_ref(head))
            .await?;
        Ok(fetched.remove(0))
    }

    pub fn cached_microdesc_count(&self) -> usize {
        self.microdescs.borrow().len()
    }

    async fn fetch_document(&self, circuit: &Circuit, path: &str) -> Result<String> {
        let mut stream = circuit.open_dir_stream(STREAM_OPEN_TIMEOUT_MS).await?;
        let request = http::Request::directory(path);

        let response = runtime::with_deadline(
            "directory fetch",
            DIR_FETCH_TIMEOUT_MS,
            http::execute(&mut stream, &request),
        )
        .await?;
        let _ = stream.close().await;

        if !response.is_success() {
            return Err(TorError::ConsensusParse(format!(
                "directory returned {} {} for {}",
                response.status, response.reason, path
            )));
        }
        Ok(response.body_text())
    }

    async fn load_stored_consensus(&self, now_secs: u64) -> Option<Consensus> {
        let index = self.load_consensus_index().await;
        let latest = index.iter().copied().max()?;
        if latest <= now_secs {
            return None;
        }

        let raw = self
            .storage
            .get(&format!("consensus:{}", latest))
            .await
            .ok()??;
        let text = String::from_utf8(raw).ok()?;
        match Consensus::parse(&text) {
            Ok(consensus) => {
                log::debug!("using stored consensus (valid until {})", latest);
                Some(consensus)
            }
            Err(e) => {
                log::warn!("stored consensus unparseable: {}", e);
                None
            }
        }
    }

    async fn store_consensus(&self, text: &str, valid_until: u64) -> Result<()> {
        self.storage
            .set(&format!("consensus:{}", valid_until), text.as_bytes())
            .await?;

        let mut index = self.load_consensus_index().await;
        if !index.contains(&valid_until) {
            index.push(valid_until);
            index.sort_unstable();
        }
        while index.len() > CONSENSUS_RETAIN {
            let oldest = index.remove(0);
            let _ = self.storage.remove(&format!("consensus:{}", oldest)).await;
        }
        let encoded = serde_json::to_vec(&index)
            .map_err(|e| TorError::Storage(format!("consensus index encode: {}", e)))?;
        self.storage.set("consensus:index", &encoded).await
    }

    async fn load_consensus_index(&self) -> Vec<u64> {
        match self.storage.get("consensus:index").await {
            Ok(Some(raw)) => serde_json::from_slice(&raw).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    async fn ensure_index_loaded(&self) {
        if self.index_loaded.get() {
            return;
        }
        self.index_loaded.set(true);

        if let Ok(Some(raw)) = self.storage.get("microdesc:index").await {
            if let Ok(index) = serde_json::from_slice::<Vec<String>>(&raw) {
                *self.microdesc_order.borrow_mut() = index.into();
            }
        }
    }

    async fn lookup_cached(&self, key: &str) -> Option<Rc<Microdesc>> {
        if let Some(md) = self.microdescs.borrow().get(key) {
            return Some(Rc::clone(md));
        }

        let raw = self
            .storage
            .get(&format!("microdesc:{}", key))
            .await
            .ok()??;
        let md: Microdesc = serde_json::from_slice(&raw).ok()?;
        let md = Rc::new(md);
        self.microdescs
            .borrow_mut()
            .insert(key.to_string(), Rc::clone(&md));
        Some(md)
    }

    async fn insert_cached(&self, key: String, md: Rc<Microdesc>) {
        match serde_json::to_vec(&*md) {
            Ok(encoded) => {
                if let Err(e) = self
                    .storage
                    .set(&format!("microdesc:{}", key), &encoded)
                    .await
                {
                    log::warn!("microdesc cache write failed: {}", e);
                }
            }
            Err(e) => log::warn!("microdesc encode failed: {}", e),
        }

        self.microdescs.borrow_mut().insert(key.clone(), md);
        self.microdesc_order.borrow_mut().push_back(key);

        // FIFO eviction keeps the cache at its bounded capacity.
        loop {
            let evict = {
                let mut order = self.microdesc_order.borrow_mut();
                if order.len() > self.capacity {
                    order.pop_front()
                } else {
                    None
                }
            };
            match evict {
                Some(old) => {
                    self.microdescs.borrow_mut().remove(&old);
                    let _ = self.storage.remove(&format!("microdesc:{}", old)).await;
                }
                None => break,
            }
        }

        let index: Vec<String> = self.microdesc_order.borrow().iter().cloned().collect();
        if let Ok(encoded) = serde_json::to_vec(&index) {
            let _ = self.storage.set("microdesc:index", &encoded).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use futures::executor::block_on;

    fn microdesc(seed: u8) -> Rc<Microdesc> {
        Rc::new(Microdesc {
            onion_key: None,
            ntor_onion_key: [seed; 32],
            id_ed25519: None,
        })
    }

    #[test]
    fn microdesc_cache_evicts_fifo() {
        let directory = Directory::with_capacity(Rc::new(MemoryStorage::new()), 3);

        block_on(async {
            for seed in 0..5u8 {
                directory
                    .insert_cached(format!("{:02x}", seed), microdesc(seed))
                    .await;
            }

            assert_eq!(directory.cached_microdesc_count(), 3);
            // Oldest two were evicted
            assert!(directory.lookup_cached("00").await.is_none());
            assert!(directory.lookup_cached("01").await.is_none());
            assert!(directory.lookup_cached("02").await.is_some());
            assert!(directory.lookup_cached("04").await.is_some());
        });
    }

    #[test]
    fn microdesc_cache_round_trips_storage() {
        let storage = Rc::new(MemoryStorage::new());
        let directory = Directory::new(Rc::clone(&storage) as Rc<dyn Storage>);

        block_on(async {
            directory
                .insert_cached("ab".into(), microdesc(7))
                .await;

            // A fresh Directory over the same storage sees the entry.
            let fresh = Directory::new(storage as Rc<dyn Storage>);
            let found = fresh.lookup_cached("ab").await.expect("persisted");
            assert_eq!(found.ntor_onion_key, [7u8; 32]);
        });
    }

    #[test]
    fn consensus_index_retains_five() {
        let storage = Rc::new(MemoryStorage::new());
        let directory = Directory::new(Rc::clone(&storage) as Rc<dyn Storage>);

        block_on(async {
            for i in 0..7u64 {
                directory
                    .store_consensus("valid-until 2024-03-01 15:00:00\nr x AAAAAAAAAAAAAAAAAAAAAAAAAAA 2024-03-01 07:00:00 1.2.3.4 9001 0\nm m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2o\ns Fast\n", 1000 + i)
                    .await
                    .unwrap();
            }

            let index = directory.load_consensus_index().await;
            assert_eq!(index, vec![1002, 1003, 1004, 1005, 1006]);
            // Evicted documents are gone from storage too.
            assert!(storage.get("consensus:1000").await.unwrap().is_none());
            assert!(storage.get("consensus:1006").await.unwrap().is_some());
        });
    }
}
