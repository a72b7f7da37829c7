//! # snowtor
//!
//! An embedded Tor client that tunnels HTTP and HTTPS requests through the
//! Tor network over a WebSocket pluggable-transport bridge.
//!
//! ## Architecture
//!
//! ```text
//! TorClient
//!   ↓ fetch(url)
//! CircuitManager ── CircuitPool ── CircuitBuilder ── Directory
//!   ↓ use_circuit(host)
//! Circuit → TorStream → (TLS) → HTTP
//!   ↓ cells
//! TorLink
//!   ↓ bytes
//! BridgeStream (WebSocket)
//! ```
//!
//! The client keeps one long-lived bridge connection, pre-builds circuits in
//! the background, binds each destination host to its own circuit, and
//! retires circuits on lifetime, error, or teardown.

use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use wasm_bindgen::prelude::*;

pub mod config;
pub mod error;
pub mod manager;
pub mod net;
pub mod pool;
pub mod protocol;
pub mod runtime;
pub mod storage;
pub mod transport;

pub use config::TorClientConfig;
pub use error::{Result, TorError};
pub use manager::{CircuitManager, HostCircuitStatus};
pub use pool::{PoolEvent, PoolStats};
pub use protocol::{Circuit, CircuitState, KeynetAddress, TorStream};
pub use storage::{MemoryStorage, Storage};

/// Deadline for opening a stream on an allocated circuit.
const STREAM_OPEN_TIMEOUT_MS: u32 = 30_000;

/// Deadline for one full HTTP exchange over a stream.
const REQUEST_TIMEOUT_MS: u32 = 120_000;

/// Set up logging once the module is instantiated.
#[wasm_bindgen(start)]
pub fn init() {
    let _ = console_log::init_with_level(log::Level::Info);
    log::info!("snowtor initialised");
}

/// Parsed destination: (host, port, path, is_https)
fn parse_url(url: &str) -> Result<(String, u16, String, bool)> {
    let url = url.trim();

    let (rest, is_https) = if let Some(rest) = url.strip_prefix("https://") {
        (rest, true)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (rest, false)
    } else {
        return Err(TorError::InvalidUrl(format!(
            "expected http:// or https:// URL, got {}",
            url
        )));
    };

    let (host_port, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if host_port.is_empty() {
        return Err(TorError::InvalidUrl(format!("URL has no host: {}", url)));
    }

    let (host, port) = match host_port.rfind(':') {
        Some(idx) => {
            let port = host_port[idx + 1..]
                .parse::<u16>()
                .map_err(|_| TorError::InvalidUrl(format!("bad port in {}", host_port)))?;
            (host_port[..idx].to_string(), port)
        }
        None => {
            let default_port = if is_https { 443 } else { 80 };
            (host_port.to_string(), default_port)
        }
    };

    // .keynet addresses are checksummed; reject bad ones before any
    // network activity.
    if KeynetAddress::is_keynet_host(&host) {
        KeynetAddress::parse(&host)?;
    }

    Ok((host, port.max(1), path.to_string(), is_https))
}

/// Options accepted by [`TorClient::fetch`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// Response handed back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// Top-level Tor client.
#[wasm_bindgen]
pub struct TorClient {
    manager: Rc<CircuitManager>,
    storage: Rc<dyn Storage>,
}

#[wasm_bindgen]
impl TorClient {
    /// Create a client. `options` is a plain object matching
    /// [`TorClientConfig`]; only `bridge_url` is required.
    #[wasm_bindgen(constructor)]
    pub fn new(options: JsValue) -> std::result::Result<TorClient, JsValue> {
        let config: TorClientConfig = serde_wasm_bindgen::from_value(options)
            .map_err(|e| JsValue::from_str(&format!("invalid options: {}", e)))?;
        Ok(Self::with_config(config)?)
    }

    /// Fetch a URL through Tor. Resolves to `{status, reason, headers,
    /// body}`.
    #[wasm_bindgen]
    pub async fn fetch(
        &self,
        url: String,
        options: JsValue,
    ) -> std::result::Result<JsValue, JsValue> {
        let options: FetchOptions = if options.is_undefined() || options.is_null() {
            FetchOptions::default()
        } else {
            serde_wasm_bindgen::from_value(options)
                .map_err(|e| JsValue::from_str(&format!("invalid fetch options: {}", e)))?
        };

        let response = self.fetch_inner(&url, options).await?;
        serde_wasm_bindgen::to_value(&response)
            .map_err(|e| JsValue::from_str(&format!("response encode: {}", e)))
    }

    /// Resolves once the circuit pool holds at least one ready circuit.
    #[wasm_bindgen]
    pub async fn wait_for_circuit(&self) -> std::result::Result<(), JsValue> {
        self.manager.wait_for_circuit().await.map_err(Into::into)
    }

    /// Snapshot of the per-host circuit bindings, keyed by hostname.
    #[wasm_bindgen]
    pub fn circuit_state(&self) -> JsValue {
        let by_host: HashMap<String, HostCircuitStatus> = self
            .manager
            .circuit_status()
            .into_iter()
            .map(|status| (status.host.clone(), status))
            .collect();
        serde_wasm_bindgen::to_value(&by_host).unwrap_or(JsValue::NULL)
    }

    /// Number of pre-built circuits currently buffered.
    #[wasm_bindgen]
    pub fn buffered_circuits(&self) -> usize {
        self.manager.buffered_circuits()
    }

    /// Provide a CCADB root-certificate snapshot (base64 DER entries) used
    /// for https connections and persisted for future sessions.
    #[wasm_bindgen]
    pub async fn set_root_certificates(
        &self,
        base64_certs: Vec<String>,
    ) -> std::result::Result<(), JsValue> {
        use base64::{engine::general_purpose, Engine as _};
        let mut ders = Vec::with_capacity(base64_certs.len());
        for encoded in &base64_certs {
            let der = general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| JsValue::from_str(&format!("bad certificate base64: {}", e)))?;
            ders.push(der);
        }
        net::tls::store_root_certificates(&self.storage, &ders)
            .await
            .map_err(Into::into)
    }

    /// Tear down circuits, pool, and the bridge connection. Idempotent.
    #[wasm_bindgen]
    pub fn close(&self) {
        self.manager.close();
    }

    /// One-shot convenience: connect, fetch once, tear down. No circuit
    /// pre-creation.
    #[wasm_bindgen(js_name = fetchOnce)]
    pub async fn fetch_once(
        bridge_url: String,
        url: String,
        options: JsValue,
    ) -> std::result::Result<JsValue, JsValue> {
        let config = TorClientConfig {
            circuit_buffer: 0,
            ..TorClientConfig::with_bridge(bridge_url)
        };
        let client = TorClient::with_config(config)?;
        let result = client.fetch(url, options).await;
        client.close();
        result
    }
}

impl TorClient {
    /// Rust-side constructor.
    pub fn with_config(config: TorClientConfig) -> Result<TorClient> {
        config.validate()?;
        let storage = storage::default_storage();
        let manager = CircuitManager::new(config, Rc::clone(&storage));
        Ok(TorClient { manager, storage })
    }

    /// Rust-side constructor with an explicit storage backend.
    pub fn with_storage(config: TorClientConfig, storage: Rc<dyn Storage>) -> Result<TorClient> {
        config.validate()?;
        let manager = CircuitManager::new(config, Rc::clone(&storage));
        Ok(TorClient { manager, storage })
    }

    async fn fetch_inner(&self, url: &str, options: FetchOptions) -> Result<FetchResponse> {
        let (host, port, path, is_https) = parse_url(url)?;
        let is_keynet = KeynetAddress::is_keynet_host(&host);
        log::info!("fetching {} via {}:{}", path, host, port);

        let storage = Rc::clone(&self.storage);
        let request = build_request(&host, &path, &options);

        self.manager
            .use_circuit(&host, |circuit| {
                let host = host.clone();
                async move {
                    // .keynet exits answer directory-style streams; everyone
                    // else gets a BEGIN to host:port.
                    let stream = if is_keynet {
                        circuit.open_dir_stream(STREAM_OPEN_TIMEOUT_MS).await?
                    } else {
                        circuit.open_stream(&host, port, STREAM_OPEN_TIMEOUT_MS).await?
                    };

                    let response = if is_https {
                        let roots = net::tls::load_root_store(&storage).await;
                        let mut tls = net::tls::TlsStream::connect(stream, &host, roots).await?;
                        let response = runtime::with_deadline(
                            "https request",
                            REQUEST_TIMEOUT_MS,
                            net::http::execute(&mut tls, &request),
                        )
                        .await?;
                        let _ = tls.close().await;
                        response
                    } else {
                        let mut stream = stream;
                        let response = runtime::with_deadline(
                            "http request",
                            REQUEST_TIMEOUT_MS,
                            net::http::execute(&mut stream, &request),
                        )
                        .await?;
                        let _ = stream.close().await;
                        response
                    };

                    log::info!("{} → {} ({} bytes)", host, response.status, response.body.len());
                    let body = response.body_text();
                    Ok(FetchResponse {
                        status: response.status,
                        reason: response.reason,
                        headers: response.headers,
                        body,
                    })
                }
            })
            .await
    }
}

fn build_request(host: &str, path: &str, options: &FetchOptions) -> net::http::Request {
    let mut request = net::http::Request::get(host, path);
    if let Some(method) = &options.method {
        request.method = method.to_ascii_uppercase();
    }
    for (name, value) in &options.headers {
        request = request.header(name, value);
    }
    if let Some(body) = &options.body {
        request.body = body.clone().into_bytes();
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_url_defaults() {
        let (host, port, path, https) = parse_url("https://example.org").unwrap();
        assert_eq!(host, "example.org");
        assert_eq!(port, 443);
        assert_eq!(path, "/");
        assert!(https);

        let (host, port, path, https) = parse_url("http://example.org/a/b?c=1").unwrap();
        assert_eq!(host, "example.org");
        assert_eq!(port, 80);
        assert_eq!(path, "/a/b?c=1");
        assert!(!https);
    }

    #[test]
    fn parse_url_explicit_port() {
        let (host, port, _, _) = parse_url("http://example.org:8080/x").unwrap();
        assert_eq!(host, "example.org");
        assert_eq!(port, 8080);
    }

    #[test]
    fn parse_url_rejects_schemeless_and_bad_ports() {
        assert!(parse_url("example.org").is_err());
        assert!(parse_url("ftp://example.org").is_err());
        assert!(parse_url("http://example.org:notaport/").is_err());
        assert!(parse_url("http://").is_err());
    }

    #[test]
    fn parse_url_validates_keynet_checksum() {
        let good = KeynetAddress::encode(&[7u8; 32]);
        let url = format!("http://{}/", good);
        let (host, port, _, _) = parse_url(&url).unwrap();
        assert_eq!(host, good);
        assert_eq!(port, 80);

        // 56 chars of valid base32 that fail the checksum
        let bad = format!("http://{}.keynet/", "a".repeat(56));
        assert!(parse_url(&bad).is_err());
    }

    #[test]
    fn build_request_applies_options() {
        let options = FetchOptions {
            method: Some("post".into()),
            headers: HashMap::from([("X-Api-Key".to_string(), "k".to_string())]),
            body: Some("{}".into()),
        };
        let request = build_request("api.example", "/v1", &options);
        assert_eq!(request.method, "POST");
        assert_eq!(request.body, b"{}");
        let text = String::from_utf8(request.to_bytes()).unwrap();
        assert!(text.contains("X-Api-Key: k\r\n"));
    }
}
