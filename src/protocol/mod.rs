//! Tor protocol implementation
//!
//! Everything between the bridge byte stream and application bytes:
//! - link protocol handshake and cell demultiplexing
//! - circuit creation (CREATE_FAST) and extension (EXTEND2/ntor)
//! - onion-layered relay cells with running digests and SENDME windows
//! - streams, the directory client, and circuit construction

pub mod cell;
mod certs;
pub mod circuit;
mod circuit_builder;
pub mod consensus;
mod directory;
pub mod flow_control;
mod kdf;
pub mod keynet;
pub mod link;
mod ntor;
pub mod stream;

pub use cell::{Cell, CellCommand, RelayCell, RelayCommand};
pub use certs::LinkIdentity;
pub use circuit::{Circuit, CircuitState, ExtendTarget};
pub use circuit_builder::CircuitBuilder;
pub use consensus::{Consensus, Microdesc, MicrodescHead};
pub use directory::Directory;
pub use keynet::KeynetAddress;
pub use link::{CellSender, CircuitId, TorLink};
pub use stream::TorStream;
