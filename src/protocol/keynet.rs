//! .keynet address codec
//!
//! A `.keynet` hostname encodes the Ed25519 public key of the relay that
//! must terminate the circuit. The label is 56 base32 characters decoding to
//! `pubkey(32) ∥ checksum(2) ∥ version(1)`, with the checksum being the
//! first two bytes of SHA3-256(".keynet checksum" ∥ pubkey ∥ version).

use data_encoding::BASE32_NOPAD;
use sha3::{Digest as _, Sha3_256};

use crate::error::{Result, TorError};

pub const KEYNET_SUFFIX: &str = ".keynet";

const CHECKSUM_PREFIX: &[u8] = b".keynet checksum";
const ADDRESS_VERSION: u8 = 3;
const LABEL_LEN: usize = 56;

/// A parsed .keynet destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeynetAddress {
    pub public_key: [u8; 32],
}

impl KeynetAddress {
    /// Whether `host` looks like a .keynet destination at all.
    pub fn is_keynet_host(host: &str) -> bool {
        host.to_ascii_lowercase().ends_with(KEYNET_SUFFIX)
    }

    /// Parse and checksum-verify a .keynet hostname.
    pub fn parse(host: &str) -> Result<Self> {
        let host = host.to_ascii_lowercase();
        let label = host
            .strip_suffix(KEYNET_SUFFIX)
            .ok_or_else(|| TorError::InvalidUrl(format!("not a .keynet host: {}", host)))?;

        if label.len() != LABEL_LEN {
            return Err(TorError::InvalidUrl(format!(
                ".keynet label must be {} characters, got {}",
                LABEL_LEN,
                label.len()
            )));
        }

        let decoded = BASE32_NOPAD
            .decode(label.to_ascii_uppercase().as_bytes())
            .map_err(|e| TorError::InvalidUrl(format!("bad .keynet base32: {}", e)))?;
        if decoded.len() != 35 {
            return Err(TorError::InvalidUrl(format!(
                ".keynet payload must be 35 bytes, got {}",
                decoded.len()
            )));
        }

        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&decoded[..32]);
        let checksum = [decoded[32], decoded[33]];
        let version = decoded[34];

        if version != ADDRESS_VERSION {
            return Err(TorError::InvalidUrl(format!(
                "unsupported .keynet version {}",
                version
            )));
        }
        if checksum != expected_checksum(&public_key, version) {
            return Err(TorError::InvalidUrl(".keynet checksum mismatch".into()));
        }

        Ok(Self { public_key })
    }

    /// Encode a public key as a .keynet hostname.
    pub fn encode(public_key: &[u8; 32]) -> String {
        let checksum = expected_checksum(public_key, ADDRESS_VERSION);

        let mut payload = Vec::with_capacity(35);
        payload.extend_from_slice(public_key);
        payload.extend_from_slice(&checksum);
        payload.push(ADDRESS_VERSION);

        format!(
            "{}{}",
            BASE32_NOPAD.encode(&payload).to_ascii_lowercase(),
            KEYNET_SUFFIX
        )
    }
}

fn expected_checksum(public_key: &[u8; 32], version: u8) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_PREFIX);
    hasher.update(public_key);
    hasher.update([version]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = [0x5eu8; 32];
        let host = KeynetAddress::encode(&key);
        assert!(host.ends_with(KEYNET_SUFFIX));
        assert_eq!(host.len(), LABEL_LEN + KEYNET_SUFFIX.len());

        let parsed = KeynetAddress::parse(&host).unwrap();
        assert_eq!(parsed.public_key, key);
    }

    #[test]
    fn is_keynet_host_detection() {
        let host = KeynetAddress::encode(&[1u8; 32]);
        assert!(KeynetAddress::is_keynet_host(&host));
        assert!(!KeynetAddress::is_keynet_host("example.org"));
    }

    #[test]
    fn flipped_checksum_rejected() {
        let host = KeynetAddress::encode(&[2u8; 32]);
        // Corrupt one character of the label (stay in the base32 alphabet).
        let mut chars: Vec<char> = host.chars().collect();
        chars[10] = if chars[10] == 'a' { 'b' } else { 'a' };
        let corrupted: String = chars.into_iter().collect();

        assert!(KeynetAddress::parse(&corrupted).is_err());
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(KeynetAddress::parse("short.keynet").is_err());
        assert!(KeynetAddress::parse("example.org").is_err());
    }
}
