//! TLS over a Tor stream
//!
//! Wraps a [`TorStream`] in a rustls client connection for https
//! destinations. The root store prefers a persisted CCADB snapshot
//! (`ccadb:cached`) when the embedder has supplied one, and falls back to
//! the compiled-in Mozilla roots.

use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use serde::{Deserialize, Serialize};

use super::http::ByteDuplex;
use crate::error::{Result, TorError};
use crate::protocol::TorStream;
use crate::runtime;
use crate::storage::Storage;

const CCADB_CACHE_KEY: &str = "ccadb:cached";
const READ_CHUNK: usize = 4096;

/// Persisted root-certificate snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct CachedRoots {
    version: u32,
    saved_at: u64,
    base64_certs: Vec<String>,
}

/// Build the TLS root store: cached CCADB roots when present and parseable,
/// compiled-in webpki roots otherwise.
pub async fn load_root_store(storage: &Rc<dyn Storage>) -> RootCertStore {
    let mut store = RootCertStore::empty();

    if let Ok(Some(raw)) = storage.get(CCADB_CACHE_KEY).await {
        if let Ok(cached) = serde_json::from_slice::<CachedRoots>(&raw) {
            if cached.version == 1 {
                let mut added = 0usize;
                for encoded in &cached.base64_certs {
                    if let Ok(der) = general_purpose::STANDARD.decode(encoded) {
                        if store.add(CertificateDer::from(der)).is_ok() {
                            added += 1;
                        }
                    }
                }
                if added > 0 {
                    log::debug!("root store: {} cached CCADB certificates", added);
                    return store;
                }
            }
        }
        log::warn!("cached root store unusable, falling back to compiled roots");
    }

    store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    store
}

/// Persist a CCADB root snapshot for future sessions.
pub async fn store_root_certificates(
    storage: &Rc<dyn Storage>,
    der_certs: &[Vec<u8>],
) -> Result<()> {
    let cached = CachedRoots {
        version: 1,
        saved_at: runtime::now_ms() / 1000,
        base64_certs: der_certs
            .iter()
            .map(|der| general_purpose::STANDARD.encode(der))
            .collect(),
    };
    let encoded = serde_json::to_vec(&cached)
        .map_err(|e| TorError::Storage(format!("root store encode: {}", e)))?;
    storage.set(CCADB_CACHE_KEY, &encoded).await
}

/// A TLS session running over one Tor stream.
pub struct TlsStream {
    stream: TorStream,
    tls: ClientConnection,
    /// Plaintext decrypted but not yet handed to the caller
    plaintext: Vec<u8>,
}

impl TlsStream {
    /// Run the TLS handshake with `server_name` over `stream`.
    pub async fn connect(
        stream: TorStream,
        server_name: &str,
        roots: RootCertStore,
    ) -> Result<Self> {
        log::info!("TLS handshake with {}", server_name);

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let name: ServerName<'static> = server_name
            .to_string()
            .try_into()
            .map_err(|_| TorError::InvalidUrl(format!("bad server name: {}", server_name)))?;
        let tls = ClientConnection::new(Arc::new(config), name)
            .map_err(|e| TorError::Internal(format!("TLS setup: {}", e)))?;

        let mut wrapped = Self {
            stream,
            tls,
            plaintext: Vec::new(),
        };
        wrapped.handshake().await?;

        log::debug!("TLS established with {}", server_name);
        Ok(wrapped)
    }

    async fn handshake(&mut self) -> Result<()> {
        while self.tls.is_handshaking() {
            self.flush_tls_output().await?;
            if self.tls.is_handshaking() && self.tls.wants_read() {
                self.pump_incoming().await?;
            }
        }
        self.flush_tls_output().await
    }

    /// Push any pending TLS records onto the Tor stream.
    async fn flush_tls_output(&mut self) -> Result<()> {
        while self.tls.wants_write() {
            let mut records = Vec::new();
            self.tls
                .write_tls(&mut records)
                .map_err(|e| TorError::Internal(format!("TLS write: {}", e)))?;
            if records.is_empty() {
                break;
            }
            self.stream.write_all(&records).await?;
        }
        Ok(())
    }

    /// Read ciphertext from the stream, process it, and collect plaintext.
    async fn pump_incoming(&mut self) -> Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TorError::TransportClosed {
                reason: "stream closed during TLS session".into(),
            });
        }

        let mut cursor = &buf[..n];
        while !cursor.is_empty() {
            let consumed = self
                .tls
                .read_tls(&mut cursor)
                .map_err(|e| TorError::Internal(format!("TLS read: {}", e)))?;
            if consumed == 0 {
                break;
            }
            let state = self
                .tls
                .process_new_packets()
                .map_err(|e| TorError::Internal(format!("TLS record: {}", e)))?;

            let available = state.plaintext_bytes_to_read();
            if available > 0 {
                let start = self.plaintext.len();
                self.plaintext.resize(start + available, 0);
                use std::io::Read as _;
                let read = self
                    .tls
                    .reader()
                    .read(&mut self.plaintext[start..])
                    .map_err(|e| TorError::Internal(format!("TLS plaintext: {}", e)))?;
                self.plaintext.truncate(start + read);
            }
        }
        Ok(())
    }

    /// Read decrypted bytes; 0 at end of session.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if !self.plaintext.is_empty() {
                let n = buf.len().min(self.plaintext.len());
                buf[..n].copy_from_slice(&self.plaintext[..n]);
                self.plaintext.drain(..n);
                return Ok(n);
            }

            match self.pump_incoming().await {
                Ok(()) => continue,
                // Orderly close (close_notify or stream EOF) ends the body.
                Err(TorError::TransportClosed { .. }) => return Ok(0),
                Err(e) => return Err(e),
            }
        }
    }

    /// Encrypt and send all of `data`.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        use std::io::Write as _;
        self.tls
            .writer()
            .write_all(data)
            .map_err(|e| TorError::Internal(format!("TLS buffer: {}", e)))?;
        self.flush_tls_output().await
    }

    /// Send close_notify and close the underlying stream.
    pub async fn close(&mut self) -> Result<()> {
        self.tls.send_close_notify();
        let _ = self.flush_tls_output().await;
        self.stream.close().await
    }
}

#[async_trait(?Send)]
impl ByteDuplex for TlsStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        TlsStream::read(self, buf).await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        TlsStream::write_all(self, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use futures::executor::block_on;

    #[test]
    fn root_store_cache_round_trip() {
        let storage: Rc<dyn Storage> = Rc::new(MemoryStorage::new());

        block_on(async {
            // Nothing cached yet: compiled-in roots.
            let store = load_root_store(&storage).await;
            assert!(!store.is_empty());

            // An unusable cache entry also falls back.
            storage.set(CCADB_CACHE_KEY, b"not json").await.unwrap();
            let store = load_root_store(&storage).await;
            assert!(!store.is_empty());
        });
    }

    #[test]
    fn cached_roots_record_shape() {
        let cached = CachedRoots {
            version: 1,
            saved_at: 1_700_000_000,
            base64_certs: vec!["aGVsbG8".into()],
        };
        let encoded = serde_json::to_vec(&cached).unwrap();
        let decoded: CachedRoots = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.base64_certs.len(), 1);
    }
}
