//! Protocol surface integration tests
//!
//! Exercises the wire codecs, addressing, and configuration through the
//! public API, without a bridge.
//!
//! Run with: wasm-pack test --headless --chrome

#![cfg(target_arch = "wasm32")]

use wasm_bindgen_test::*;

wasm_bindgen_test_configure!(run_in_browser);

use snowtor::protocol::cell::{Cell, CellCommand, RelayCell, RelayCommand, MAX_RELAY_DATA};
use snowtor::protocol::KeynetAddress;
use snowtor::TorClientConfig;

#[wasm_bindgen_test]
fn fixed_cell_frame_is_514_bytes() {
    let cell = Cell::new(0x8000_0001, CellCommand::Netinfo, vec![0u8; 12]);
    assert_eq!(cell.to_bytes().len(), 514);
}

#[wasm_bindgen_test]
fn relay_data_chunking_boundary() {
    // 498 bytes is one cell's worth of data; 499 needs two.
    assert_eq!(MAX_RELAY_DATA, 498);

    let exact = RelayCell::new(RelayCommand::Data, 1, vec![0u8; MAX_RELAY_DATA]);
    let parsed = RelayCell::from_payload(&exact.to_payload()).unwrap();
    assert_eq!(parsed.data.len(), MAX_RELAY_DATA);

    let oversize = vec![0u8; MAX_RELAY_DATA + 1];
    let chunks: Vec<&[u8]> = oversize.chunks(MAX_RELAY_DATA).collect();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].len(), 1);
}

#[wasm_bindgen_test]
fn keynet_address_round_trip() {
    let key = [0x42u8; 32];
    let host = KeynetAddress::encode(&key);
    let parsed = KeynetAddress::parse(&host).unwrap();
    assert_eq!(parsed.public_key, key);
}

#[wasm_bindgen_test]
fn config_defaults() {
    let config = TorClientConfig::with_bridge("wss://bridge.example/ws");
    assert!(config.validate().is_ok());
    assert_eq!(config.circuit_buffer, 2);
    assert_eq!(config.connection_timeout_ms, 15_000);
}

#[wasm_bindgen_test]
fn client_rejects_bad_bridge_url() {
    let config = TorClientConfig::with_bridge("https://not-a-websocket.example");
    assert!(snowtor::TorClient::with_config(config).is_err());
}

#[wasm_bindgen_test]
fn client_close_is_idempotent() {
    let config = TorClientConfig {
        circuit_buffer: 0,
        ..TorClientConfig::with_bridge("wss://bridge.example/ws")
    };
    let client = snowtor::TorClient::with_config(config).unwrap();
    client.close();
    client.close();
}
