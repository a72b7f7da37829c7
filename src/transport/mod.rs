//! Bridge transport
//!
//! The client holds exactly one connection to its bridge: a WebSocket
//! carrying the Tor byte stream inside the pluggable-transport framing
//! (Snowflake-style). The framing is the browser's problem; this layer
//! exposes a reliable byte-duplex and nothing else.

mod websocket;

pub use websocket::BridgeStream;
