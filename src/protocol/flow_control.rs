//! SENDME flow control
//!
//! Windows exist at two levels. Each hop of a circuit has `package` /
//! `delivery` windows of 1000 cells credited in steps of 100; each stream
//! has windows of 500 credited in steps of 50. Circuit-level SENDMEs are
//! version 1 and carry the authenticator digest of the data cell at the
//! crediting boundary; the sender keeps a FIFO of those digests and verifies
//! the echo before crediting.

use std::collections::VecDeque;

use crate::error::{Result, TorError};

/// Per-hop circuit-level windows.
#[derive(Debug, Clone)]
pub struct CircuitWindow {
    /// Cells we may still send toward this hop
    pub package: u16,

    /// Cells the hop may still send us before we owe a SENDME
    pub delivery: u16,

    /// Authenticator digests awaiting a SENDME echo, oldest first
    pending_digests: VecDeque<[u8; 20]>,

    /// Digest of the most recently delivered data cell
    last_delivered: Option<[u8; 20]>,
}

impl CircuitWindow {
    pub const INITIAL: u16 = 1000;
    pub const INCREMENT: u16 = 100;
    /// Delivery level at which we replenish and send a SENDME
    pub const DELIVERY_THRESHOLD: u16 = 900;

    pub fn new() -> Self {
        Self {
            package: Self::INITIAL,
            delivery: Self::INITIAL,
            pending_digests: VecDeque::new(),
            last_delivered: None,
        }
    }

    pub fn can_package(&self) -> bool {
        self.package > 0
    }

    /// Account one outbound data cell. `digest` is the running forward
    /// digest after the cell was hashed; it is recorded whenever the window
    /// crosses a crediting boundary so the peer's SENDME echo can be
    /// verified later.
    pub fn note_packaged(&mut self, digest: [u8; 20]) -> Result<()> {
        if self.package == 0 {
            return Err(TorError::Internal("package window underflow".into()));
        }
        self.package -= 1;
        if self.package % Self::INCREMENT == 0 {
            self.pending_digests.push_back(digest);
        }
        Ok(())
    }

    /// Apply a circuit-level SENDME from the peer.
    ///
    /// Version 1 payloads carry the echoed digest, which must match the
    /// oldest recorded authenticator. Version 0 payloads credit blindly.
    pub fn note_sendme(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() >= 3 && payload[0] == 1 {
            let len = u16::from_be_bytes([payload[1], payload[2]]) as usize;
            if len != 20 || payload.len() < 3 + len {
                return Err(TorError::InvalidSendmeDigest);
            }
            let expected = self
                .pending_digests
                .pop_front()
                .ok_or(TorError::InvalidSendmeDigest)?;
            if payload[3..23] != expected {
                return Err(TorError::InvalidSendmeDigest);
            }
        } else {
            // v0: no authenticator to check
            self.pending_digests.pop_front();
        }

        self.package = self.package.saturating_add(Self::INCREMENT);
        Ok(())
    }

    /// Account one inbound data cell. `digest` is the running backward
    /// digest after the cell was committed. Returns the SENDME payload to
    /// emit when the delivery window hits the replenish threshold.
    pub fn note_delivered(&mut self, digest: [u8; 20]) -> Option<Vec<u8>> {
        self.delivery = self.delivery.saturating_sub(1);
        self.last_delivered = Some(digest);

        if self.delivery <= Self::DELIVERY_THRESHOLD {
            self.delivery = Self::INITIAL;
            let digest = self.last_delivered.unwrap_or([0u8; 20]);

            let mut payload = Vec::with_capacity(23);
            payload.push(1); // SENDME version 1
            payload.extend_from_slice(&20u16.to_be_bytes());
            payload.extend_from_slice(&digest);
            return Some(payload);
        }
        None
    }
}

impl Default for CircuitWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-stream windows.
#[derive(Debug, Clone)]
pub struct StreamWindow {
    pub package: u16,
    pub delivery: u16,
}

impl StreamWindow {
    pub const INITIAL: u16 = 500;
    pub const INCREMENT: u16 = 50;
    /// Delivery level at which we replenish and send a stream SENDME
    pub const DELIVERY_THRESHOLD: u16 = 450;

    pub fn new() -> Self {
        Self {
            package: Self::INITIAL,
            delivery: Self::INITIAL,
        }
    }

    pub fn can_package(&self) -> bool {
        self.package > 0
    }

    pub fn note_packaged(&mut self) -> Result<()> {
        if self.package == 0 {
            return Err(TorError::Internal("stream package window underflow".into()));
        }
        self.package -= 1;
        Ok(())
    }

    pub fn note_sendme(&mut self) {
        self.package = self.package.saturating_add(Self::INCREMENT);
    }

    /// Returns true when a stream-level SENDME should be sent.
    pub fn note_delivered(&mut self) -> bool {
        self.delivery = self.delivery.saturating_sub(1);
        if self.delivery <= Self::DELIVERY_THRESHOLD {
            self.delivery = Self::INITIAL;
            return true;
        }
        false
    }
}

impl Default for StreamWindow {
    fn default() -> Self {
        Self::new()
    }
}
