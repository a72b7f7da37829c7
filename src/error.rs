//! Error types for the snowtor client
//!
//! The error set is closed: every failure mode the library can surface is a
//! named variant here, grouped by the subsystem that raises it. Errors are
//! `Clone` because coalesced allocation futures fan one failure out to every
//! waiting caller.

use thiserror::Error;
use wasm_bindgen::JsValue;

pub type Result<T> = std::result::Result<T, TorError>;

/// Main error type for the snowtor client
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Transport (bridge) =====
    #[error("bridge connect failed: {cause}")]
    TransportConnect { cause: String },

    #[error("bridge connection closed: {reason}")]
    TransportClosed { reason: String },

    // ===== Link =====
    #[error("link version negotiation failed: {0}")]
    InvalidVersion(String),

    #[error("link certificate invalid: {0}")]
    InvalidCert(String),

    #[error("link protocol violation: {0}")]
    LinkProtocol(String),

    #[error("peer disconnected")]
    PeerDisconnected,

    // ===== Circuit build =====
    #[error("not enough usable relays: {0}")]
    InsufficientRelays(String),

    #[error("circuit extension failed: {0}")]
    ExtendFailed(String),

    #[error("CREATED_FAST key hash mismatch")]
    KdfKeyHash,

    #[error("no relay matches the requested .keynet key")]
    KeynetExitNotFound,

    #[error("circuit build attempts exhausted: {last_cause}")]
    CircuitBuildExhausted { last_cause: String },

    // ===== Relay / stream =====
    #[error("relay cell not recognized by any hop")]
    UnrecognisedRelay,

    #[error("relay cell digest mismatch")]
    InvalidRelayDigest,

    #[error("SENDME digest does not match recorded authenticator")]
    InvalidSendmeDigest,

    #[error("stream ended by relay: reason={reason} ({reason_name})")]
    RelayEnded { reason: u8, reason_name: String },

    #[error("relay cell for unexpected stream {0}")]
    UnexpectedStream(u16),

    #[error("relay cell for unknown stream {0}")]
    UnknownStream(u16),

    // ===== Directory =====
    #[error("microdescriptor hash mismatch")]
    MicrodescHashMismatch,

    #[error("consensus parse error: {0}")]
    ConsensusParse(String),

    // ===== Manager =====
    #[error("operation timed out: {op}")]
    Timeout { op: String },

    #[error("client is closed")]
    Closed,

    // ===== Ambient =====
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TorError {
    /// Whether this error is fatal to the whole link.
    ///
    /// A fatal error tears down every circuit over the bridge connection;
    /// the manager drops its cached link and reconnects on the next request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorError::TransportConnect { .. }
                | TorError::TransportClosed { .. }
                | TorError::InvalidVersion(_)
                | TorError::InvalidCert(_)
                | TorError::LinkProtocol(_)
                | TorError::PeerDisconnected
        )
    }

    /// Whether the operation can be retried with a fresh circuit or relay
    /// selection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::ExtendFailed(_)
                | TorError::KdfKeyHash
                | TorError::Timeout { .. }
                | TorError::TransportConnect { .. }
                | TorError::TransportClosed { .. }
                | TorError::PeerDisconnected
        )
    }

    /// Convenience for deadline expiries.
    pub fn timeout(op: impl Into<String>) -> Self {
        TorError::Timeout { op: op.into() }
    }

    /// Build a `RelayEnded` error carrying the tor-spec reason name.
    pub fn relay_ended(reason: u8) -> Self {
        TorError::RelayEnded {
            reason,
            reason_name: end_reason_name(reason).to_string(),
        }
    }
}

/// RELAY_END reason names per tor-spec
pub fn end_reason_name(reason: u8) -> &'static str {
    match reason {
        1 => "MISC",
        2 => "RESOLVEFAILED",
        3 => "CONNECTREFUSED",
        4 => "EXITPOLICY",
        5 => "DESTROY",
        6 => "DONE",
        7 => "TIMEOUT",
        8 => "NOROUTE",
        9 => "HIBERNATING",
        10 => "INTERNAL",
        11 => "RESOURCELIMIT",
        12 => "CONNRESET",
        13 => "TORPROTOCOL",
        14 => "NOTDIRECTORY",
        _ => "UNKNOWN",
    }
}

/// DESTROY reason names per tor-spec
pub fn destroy_reason_name(reason: u8) -> &'static str {
    match reason {
        0 => "NONE",
        1 => "PROTOCOL",
        2 => "INTERNAL",
        3 => "REQUESTED",
        4 => "HIBERNATING",
        5 => "RESOURCELIMIT",
        6 => "CONNECTFAILED",
        7 => "OR_IDENTITY",
        8 => "CHANNEL_CLOSED",
        9 => "FINISHED",
        10 => "TIMEOUT",
        11 => "DESTROYED",
        12 => "NOSUCHSERVICE",
        _ => "UNKNOWN",
    }
}

impl From<TorError> for JsValue {
    fn from(err: TorError) -> Self {
        JsValue::from_str(&err.to_string())
    }
}
