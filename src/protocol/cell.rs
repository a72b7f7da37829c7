//! Tor cell codecs
//!
//! Cells are the wire unit of the link protocol. After version negotiation
//! the frame is 514 bytes: circuit ID (4), command (1), payload (509).
//! Variable-length commands carry a 16-bit length prefix instead of padding.
//! Before the VERSIONS exchange completes, circuit IDs are 2 bytes.

use rand::RngCore;

use crate::error::{Result, TorError};

/// Fixed cell size after link protocol v4+
pub const CELL_LEN: usize = 514;

/// Payload size of a fixed-length cell
pub const PAYLOAD_LEN: usize = 509;

/// Relay header: command (1) + recognized (2) + stream (2) + digest (4) + length (2)
pub const RELAY_HEADER_LEN: usize = 11;

/// Maximum data bytes in one relay cell
pub const MAX_RELAY_DATA: usize = PAYLOAD_LEN - RELAY_HEADER_LEN;

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    Padding = 0,
    Create = 1,
    Created = 2,
    Relay = 3,
    Destroy = 4,
    CreateFast = 5,
    CreatedFast = 6,
    Versions = 7,
    Netinfo = 8,
    RelayEarly = 9,
    Create2 = 10,
    Created2 = 11,
    PaddingNegotiate = 12,
    Vpadding = 128,
    Certs = 129,
    AuthChallenge = 130,
    Authenticate = 131,
    Authorize = 132,
}

impl CellCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Variable-length commands carry an explicit 16-bit payload length.
    pub fn is_variable(self) -> bool {
        self == CellCommand::Versions || (self as u8) >= 128
    }
}

/// A link-protocol cell
#[derive(Debug, Clone)]
pub struct Cell {
    pub circuit_id: u32,
    pub command: CellCommand,
    pub payload: Vec<u8>,
}

impl Cell {
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Serialize with the post-negotiation 4-byte circuit ID.
    ///
    /// Fixed-length commands are padded (or truncated) to the 514-byte
    /// frame; variable-length commands get a 16-bit length prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        if self.command.is_variable() {
            let mut buf = Vec::with_capacity(7 + self.payload.len());
            buf.extend_from_slice(&self.circuit_id.to_be_bytes());
            buf.push(self.command as u8);
            buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
            buf.extend_from_slice(&self.payload);
            buf
        } else {
            let mut buf = Vec::with_capacity(CELL_LEN);
            buf.extend_from_slice(&self.circuit_id.to_be_bytes());
            buf.push(self.command as u8);
            buf.extend_from_slice(&self.payload[..self.payload.len().min(PAYLOAD_LEN)]);
            buf.resize(CELL_LEN, 0);
            buf
        }
    }

    /// Serialize a VERSIONS cell with the legacy 2-byte circuit ID used
    /// before negotiation completes.
    pub fn versions_to_legacy_bytes(offered: &[u16]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + offered.len() * 2);
        buf.extend_from_slice(&[0x00, 0x00]); // circuit ID 0
        buf.push(CellCommand::Versions as u8);
        buf.extend_from_slice(&((offered.len() * 2) as u16).to_be_bytes());
        for version in offered {
            buf.extend_from_slice(&version.to_be_bytes());
        }
        buf
    }

    /// Parse a fixed-length 514-byte frame.
    pub fn from_fixed_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < CELL_LEN {
            return Err(TorError::LinkProtocol(format!(
                "short cell: {} bytes",
                data.len()
            )));
        }
        let circuit_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let command = CellCommand::from_u8(data[4])
            .ok_or_else(|| TorError::LinkProtocol(format!("unknown cell command {}", data[4])))?;
        Ok(Self {
            circuit_id,
            command,
            payload: data[5..CELL_LEN].to_vec(),
        })
    }
}

/// Relay command types (inside RELAY / RELAY_EARLY payloads)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    Begin = 1,
    Data = 2,
    End = 3,
    Connected = 4,
    Sendme = 5,
    Extend = 6,
    Extended = 7,
    Truncate = 8,
    Truncated = 9,
    Drop = 10,
    Resolve = 11,
    Resolved = 12,
    BeginDir = 13,
    Extend2 = 14,
    Extended2 = 15,
}

impl RelayCommand {
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
        _ => None,
        }
    }
}

/// Decrypted relay cell
#[derive(Debug, Clone)]
pub struct RelayCell {
    pub command: RelayCommand,
    pub recognized: u16,
    pub stream_id: u16,
    pub digest: [u8; 4],
    pub data: Vec<u8>,
}

impl RelayCell {
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= MAX_RELAY_DATA);
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Serialize to the 509-byte relay payload with the digest field zeroed.
    ///
    /// Padding after the data is a 4-byte zero gap followed by random bytes,
    /// per the current relay-cell layout.
    pub fn to_payload(&self) -> [u8; PAYLOAD_LEN] {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0] = self.command as u8;
        payload[1..3].copy_from_slice(&self.recognized.to_be_bytes());
        payload[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        // digest slot stays zero; the circuit fills it after hashing
        payload[9..11].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        payload[RELAY_HEADER_LEN..RELAY_HEADER_LEN + self.data.len()]
            .copy_from_slice(&self.data);

        let padding_start = RELAY_HEADER_LEN + self.data.len() + 4;
        if padding_start < PAYLOAD_LEN {
            rand::thread_rng().fill_bytes(&mut payload[padding_start..]);
        }
        payload
    }

    /// Parse a decrypted 509-byte relay payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < RELAY_HEADER_LEN {
            return Err(TorError::LinkProtocol("relay payload too short".into()));
        }
        let command = RelayCommand::from_u8(payload[0]).ok_or_else(|| {
            TorError::LinkProtocol(format!("unknown relay command {}", payload[0]))
        })?;
        let recognized = u16::from_be_bytes([payload[1], payload[2]]);
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let digest = [payload[5], payload[6], payload[7], payload[8]];
        let length = u16::from_be_bytes([payload[9], payload[10]]) as usize;

        if RELAY_HEADER_LEN + length > payload.len() {
            return Err(TorError::LinkProtocol(format!(
                "relay length {} exceeds payload",
                length
            )));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: payload[RELAY_HEADER_LEN..RELAY_HEADER_LEN + length].to_vec(),
        })
    }
}
