//! Microdescriptor consensus and microdescriptor parsing
//!
//! The consensus is the line-oriented text document published by the
//! directory authorities (microdesc flavor): one `r`/`m`/`s` line group per
//! relay plus document-level validity timestamps. Microdescriptors are
//! fetched separately and matched to their `m` hash by SHA-256.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{Result, TorError};

/// One relay's entry in the consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrodescHead {
    pub nickname: String,
    /// RSA identity fingerprint (20 bytes, from the `r` line)
    pub identity: [u8; 20],
    /// SHA-256 of the relay's microdescriptor (from the `m` line)
    pub microdesc_hash: [u8; 32],
    pub ip: [u8; 4],
    pub or_port: u16,
    pub flags: Vec<String>,
}

impl MicrodescHead {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Usable as a middle hop: Fast, Stable, and a directory cache.
    pub fn is_middle(&self) -> bool {
        self.has_flag("Fast") && self.has_flag("Stable") && self.has_flag("V2Dir")
    }

    /// Usable as an exit: Fast, Stable, Exit, and not flagged BadExit.
    pub fn is_exit(&self) -> bool {
        self.has_flag("Fast")
            && self.has_flag("Stable")
            && self.has_flag("Exit")
            && !self.has_flag("BadExit")
    }
}

/// Parsed consensus document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consensus {
    /// `valid-until`, seconds since the epoch
    pub valid_until: u64,
    pub relays: Vec<MicrodescHead>,
}

impl Consensus {
    pub fn is_fresh(&self, now_secs: u64) -> bool {
        now_secs < self.valid_until
    }

    /// Parse the microdesc-flavor consensus text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut valid_until = None;
        let mut relays = Vec::new();
        let mut current: Option<PartialHead> = None;

        for line in text.lines() {
            let mut words = line.split_ascii_whitespace();
            match words.next() {
                Some("valid-until") => {
                    let date = words.next().ok_or_else(|| bad("valid-until missing date"))?;
                    let time = words.next().ok_or_else(|| bad("valid-until missing time"))?;
                    valid_until = Some(parse_timestamp(date, time)?);
                }
                Some("r") => {
                    if let Some(partial) = current.take() {
                        relays.extend(partial.finish());
                    }
                    current = Some(PartialHead::from_r_line(line)?);
                }
                Some("m") => {
                    if let Some(partial) = current.as_mut() {
                        let hash_b64 =
                            words.next().ok_or_else(|| bad("m line missing digest"))?;
                        partial.microdesc_hash = Some(decode_b64_32(hash_b64)?);
                    }
                }
                Some("s") => {
                    if let Some(partial) = current.as_mut() {
                        partial.flags = words.map(str::to_string).collect();
                    }
                }
                _ => {}
            }
        }
        if let Some(partial) = current.take() {
            relays.extend(partial.finish());
        }

        let valid_until = valid_until.ok_or_else(|| bad("document has no valid-until"))?;
        if relays.is_empty() {
            return Err(bad("document lists no relays"));
        }

        log::info!(
            "parsed consensus: {} relays, valid until {}",
            relays.len(),
            valid_until
        );
        Ok(Self {
            valid_until,
            relays,
        })
    }
}

struct PartialHead {
    nickname: String,
    identity: [u8; 20],
    ip: [u8; 4],
    or_port: u16,
    microdesc_hash: Option<[u8; 32]>,
    flags: Vec<String>,
}

impl PartialHead {
    /// `r nickname identity-b64 published-date published-time IP ORPort DirPort`
    fn from_r_line(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_ascii_whitespace().collect();
        if words.len() < 8 {
            return Err(bad(&format!("short r line: {}", line)));
        }

        let identity_bytes = general_purpose::STANDARD_NO_PAD
            .decode(words[2])
            .map_err(|e| bad(&format!("bad identity base64: {}", e)))?;
        let identity: [u8; 20] = identity_bytes
            .try_into()
            .map_err(|_| bad("identity is not 20 bytes"))?;

        let mut ip = [0u8; 4];
        let octets: Vec<&str> = words[5].split('.').collect();
        if octets.len() != 4 {
            return Err(bad(&format!("bad IPv4 address {}", words[5])));
        }
        for (slot, octet) in ip.iter_mut().zip(octets) {
            *slot = octet
                .parse()
                .map_err(|_| bad(&format!("bad IPv4 octet {}", octet)))?;
        }

        let or_port = words[6]
            .parse()
            .map_err(|_| bad(&format!("bad ORPort {}", words[6])))?;

        Ok(Self {
            nickname: words[1].to_string(),
            identity,
            ip,
            or_port,
            microdesc_hash: None,
            flags: Vec::new(),
        })
    }

    fn finish(self) -> Option<MicrodescHead> {
        // Entries without an m line can never be extended to; drop them.
        let microdesc_hash = self.microdesc_hash?;
        Some(MicrodescHead {
            nickname: self.nickname,
            identity: self.identity,
            microdesc_hash,
            ip: self.ip,
            or_port: self.or_port,
            flags: self.flags,
        })
    }
}

/// A relay's microdescriptor: the key bundle needed to extend through it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Microdesc {
    /// RSA onion key (PEM body), kept for completeness
    pub onion_key: Option<String>,
    /// Curve25519 ntor onion key
    pub ntor_onion_key: [u8; 32],
    /// Ed25519 identity, when published
    pub id_ed25519: Option<[u8; 32]>,
}

impl Microdesc {
    /// Parse one microdescriptor body.
    pub fn parse(text: &str) -> Result<Self> {
        let mut onion_key = None;
        let mut ntor_onion_key = None;
        let mut id_ed25519 = None;

        let mut lines = text.lines().peekable();
        while let Some(line) = lines.next() {
            if line == "onion-key" {
                let mut pem = String::new();
                for pem_line in lines.by_ref() {
                    if pem_line.starts_with("-----END") {
                        break;
                    }
                    if !pem_line.starts_with("-----BEGIN") {
                        pem.push_str(pem_line);
                    }
                }
                onion_key = Some(pem);
            } else if let Some(rest) = line.strip_prefix("ntor-onion-key ") {
                let bytes = general_purpose::STANDARD_NO_PAD
                    .decode(rest.trim_end_matches('='))
                    .map_err(|e| bad(&format!("bad ntor key base64: {}", e)))?;
                let key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| bad("ntor key is not 32 bytes"))?;
                ntor_onion_key = Some(key);
            } else if let Some(rest) = line.strip_prefix("id ed25519 ") {
                id_ed25519 = Some(decode_b64_32(rest)?);
            }
        }

        Ok(Self {
            onion_key,
            ntor_onion_key: ntor_onion_key
                .ok_or_else(|| bad("microdescriptor has no ntor-onion-key"))?,
            id_ed25519,
        })
    }

    /// SHA-256 of the raw microdescriptor text, as referenced by `m` lines.
    pub fn digest(text: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.finalize().into()
    }
}

/// Split a batch response into individual microdescriptor bodies.
///
/// Each microdescriptor starts with its `onion-key` line; the digest covers
/// the body from that line up to the next one.
pub fn split_microdescs(text: &str) -> Vec<String> {
    let mut bodies = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        if line == "onion-key" && !current.is_empty() {
            bodies.push(std::mem::take(&mut current));
        }
        if line == "onion-key" || !current.is_empty() {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.is_empty() {
        bodies.push(current);
    }
    bodies
}

fn decode_b64_32(encoded: &str) -> Result<[u8; 32]> {
    let bytes = general_purpose::STANDARD_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| bad(&format!("bad base64: {}", e)))?;
    bytes.try_into().map_err(|_| bad("value is not 32 bytes"))
}

fn bad(message: &str) -> TorError {
    TorError::ConsensusParse(message.to_string())
}

/// Parse a dir-spec `YYYY-MM-DD HH:MM:SS` timestamp into epoch seconds.
fn parse_timestamp(date: &str, time: &str) -> Result<u64> {
    let date_parts: Vec<&str> = date.split('-').collect();
    let time_parts: Vec<&str> = time.split(':').collect();
    if date_parts.len() != 3 || time_parts.len() != 3 {
        return Err(bad(&format!("bad timestamp {} {}", date, time)));
    }

    let year: i64 = date_parts[0].parse().map_err(|_| bad("bad year"))?;
    let month: i64 = date_parts[1].parse().map_err(|_| bad("bad month"))?;
    let day: i64 = date_parts[2].parse().map_err(|_| bad("bad day"))?;
    let hour: u64 = time_parts[0].parse().map_err(|_| bad("bad hour"))?;
    let minute: u64 = time_parts[1].parse().map_err(|_| bad("bad minute"))?;
    let second: u64 = time_parts[2].parse().map_err(|_| bad("bad second"))?;

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 60 {
        return Err(bad(&format!("timestamp out of range: {} {}", date, time)));
    }

    // Days since the epoch for a proleptic Gregorian civil date.
    let years = if month <= 2 { year - 1 } else { year };
    let era = if years >= 0 { years } else { years - 399 } / 400;
    let year_of_era = years - era * 400;
    let day_of_year = (153 * (if month > 2 { month - 3 } else { month + 9 }) + 2) / 5 + day - 1;
    let day_of_era = year_of_era * 365 + year_of_era / 4 - year_of_era / 100 + day_of_year;
    let days = era * 146_097 + day_of_era - 719_468;

    if days < 0 {
        return Err(bad("timestamp before the epoch"));
    }
    Ok(days as u64 * 86_400 + hour * 3_600 + minute * 60 + second)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
network-status-version 3 microdesc
vote-status consensus
valid-after 2024-03-01 12:00:00
fresh-until 2024-03-01 13:00:00
valid-until 2024-03-01 15:00:00
r alpha AAAAAAAAAAAAAAAAAAAAAAAAAAA 2024-03-01 07:00:00 10.0.0.1 9001 0
m m1m1m1m1m1m1m1m1m1m1m1m1m1m1m1m1m1m1m1m1m1o
s Fast Running Stable V2Dir Valid
r bravo BBBBBBBBBBBBBBBBBBBBBBBBBBB 2024-03-01 07:00:00 10.0.0.2 443 0
m m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2o
s Exit Fast Running Stable Valid
r charlie CCCCCCCCCCCCCCCCCCCCCCCCCCC 2024-03-01 07:00:00 10.0.0.3 9001 0
m m3m3m3m3m3m3m3m3m3m3m3m3m3m3m3m3m3m3m3m3m3o
s BadExit Exit Fast Running Stable Valid
";

    #[test]
    fn parses_sample_consensus() {
        let consensus = Consensus::parse(SAMPLE).unwrap();
        assert_eq!(consensus.relays.len(), 3);

        let alpha = &consensus.relays[0];
        assert_eq!(alpha.nickname, "alpha");
        assert_eq!(alpha.ip, [10, 0, 0, 1]);
        assert_eq!(alpha.or_port, 9001);
        assert!(alpha.is_middle());
        assert!(!alpha.is_exit());

        let bravo = &consensus.relays[1];
        assert!(bravo.is_exit());
        assert!(!bravo.is_middle());

        // BadExit disqualifies charlie
        assert!(!consensus.relays[2].is_exit());
    }

    #[test]
    fn valid_until_is_parsed() {
        let consensus = Consensus::parse(SAMPLE).unwrap();
        // 2024-03-01 15:00:00 UTC
        assert_eq!(consensus.valid_until, 1_709_305_200);
        assert!(consensus.is_fresh(1_709_305_199));
        assert!(!consensus.is_fresh(1_709_305_200));
    }

    #[test]
    fn relay_without_m_line_is_dropped() {
        let text = "\
valid-until 2024-03-01 15:00:00
r lonely AAAAAAAAAAAAAAAAAAAAAAAAAAA 2024-03-01 07:00:00 10.0.0.1 9001 0
s Fast Running
r paired BBBBBBBBBBBBBBBBBBBBBBBBBBB 2024-03-01 07:00:00 10.0.0.2 9001 0
m m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2m2o
s Fast Running
";
        let consensus = Consensus::parse(text).unwrap();
        assert_eq!(consensus.relays.len(), 1);
        assert_eq!(consensus.relays[0].nickname, "paired");
    }

    #[test]
    fn empty_document_rejected() {
        assert!(Consensus::parse("valid-until 2024-03-01 15:00:00\n").is_err());
        assert!(Consensus::parse("").is_err());
    }

    #[test]
    fn timestamp_epoch_math() {
        assert_eq!(parse_timestamp("1970-01-01", "00:00:00").unwrap(), 0);
        assert_eq!(parse_timestamp("1970-01-02", "00:00:01").unwrap(), 86_401);
        assert_eq!(
            parse_timestamp("2000-03-01", "00:00:00").unwrap(),
            951_868_800
        );
        assert!(parse_timestamp("2024-13-01", "00:00:00").is_err());
    }

    const MICRODESC: &str = "\
onion-key
-----BEGIN RSA PUBLIC KEY-----
MIGJAoGBAMfake
-----END RSA PUBLIC KEY-----
ntor-onion-key 3vl1ln0sBVqaJV9CM2QQbMPp1jSgJR3zUDo9eKLhYcA
id ed25519 7Zf0nV9c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1cE
";

    #[test]
    fn parses_microdesc_keys() {
        let md = Microdesc::parse(MICRODESC).unwrap();
        assert!(md.onion_key.is_some());
        assert!(md.id_ed25519.is_some());

        let expected = general_purpose::STANDARD_NO_PAD
            .decode("3vl1ln0sBVqaJV9CM2QQbMPp1jSgJR3zUDo9eKLhYcA")
            .unwrap();
        assert_eq!(md.ntor_onion_key.to_vec(), expected);
    }

    #[test]
    fn microdesc_without_ntor_key_rejected() {
        assert!(Microdesc::parse("id ed25519 xyz\n").is_err());
    }

    #[test]
    fn splits_concatenated_microdescs() {
        let batch = format!("{}{}", MICRODESC, MICRODESC);
        let bodies = split_microdescs(&batch);
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0], MICRODESC);
        assert_eq!(Microdesc::digest(&bodies[0]), Microdesc::digest(&bodies[1]));
    }
}
