//! CERTS cell parsing and link certificate checking
//!
//! The CERTS cell binds the bridge's TLS-level keys to its long-term Tor
//! identities. Validation yields the 20-byte RSA identity used as the
//! CREATE_FAST hop identity, and checks the Ed25519 chain (signing-key cert,
//! RSA→Ed25519 cross-cert) including expiry.
//!
//! Reference: tor-spec §4.2, cert-spec.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha1::{Digest as _, Sha1};

use crate::error::{Result, TorError};
use crate::runtime;

/// Certificate types carried in a CERTS cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CertType {
    /// RSA link key, signed with the RSA identity (legacy)
    RsaLink = 1,
    /// RSA-1024 identity, self-signed X.509
    RsaId = 2,
    /// RSA AUTHENTICATE key (legacy)
    RsaAuth = 3,
    /// Ed25519 signing key, signed with the Ed25519 identity
    Ed25519SigningKey = 4,
    /// TLS link certificate digest, signed with the Ed25519 signing key
    Ed25519TlsLink = 5,
    /// Ed25519 AUTHENTICATE key
    Ed25519AuthKey = 6,
    /// Ed25519 identity, signed with the RSA identity (cross-cert)
    Ed25519Identity = 7,
}

/// One raw certificate entry
#[derive(Debug, Clone)]
pub struct CertEntry {
    pub cert_type: u8,
    pub data: Vec<u8>,
}

/// Parsed CERTS cell
#[derive(Debug)]
pub struct CertsCell {
    pub certificates: Vec<CertEntry>,
}

impl CertsCell {
    /// Parse a CERTS cell payload: N (1) then N × (type (1), len (2), data).
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(TorError::InvalidCert("empty CERTS cell".into()));
        }

        let n_certs = data[0] as usize;
        let mut offset = 1;
        let mut certificates = Vec::with_capacity(n_certs);

        for i in 0..n_certs {
            if offset + 3 > data.len() {
                return Err(TorError::InvalidCert(format!(
                    "CERTS cell truncated at certificate {}",
                    i
                )));
            }
            let cert_type = data[offset];
            let len = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
            offset += 3;

            if offset + len > data.len() {
                return Err(TorError::InvalidCert(format!(
                    "certificate {} overruns cell ({} bytes declared)",
                    i, len
                )));
            }
            certificates.push(CertEntry {
                cert_type,
                data: data[offset..offset + len].to_vec(),
            });
            offset += len;
        }

        Ok(Self { certificates })
    }

    fn find(&self, cert_type: CertType) -> Option<&CertEntry> {
        self.certificates
            .iter()
            .find(|c| c.cert_type == cert_type as u8)
    }
}

/// Tor's Ed25519 certificate format (cert-spec §2.1)
#[derive(Debug, Clone)]
pub struct Ed25519Cert {
    pub cert_type: u8,
    pub expiration_hours: u32,
    pub certified_key: [u8; 32],
    /// Signing key from the signed-with-ed25519-key extension, if present
    pub signing_key: Option<[u8; 32]>,
    raw_signed: Vec<u8>,
    signature: [u8; 64],
}

impl Ed25519Cert {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 104 {
            return Err(TorError::InvalidCert(format!(
                "Ed25519 cert too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != 0x01 {
            return Err(TorError::InvalidCert(format!(
                "unknown Ed25519 cert version {}",
                data[0]
            )));
        }

        let cert_type = data[1];
        let expiration_hours = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);

        let mut certified_key = [0u8; 32];
        certified_key.copy_from_slice(&data[7..39]);

        let n_extensions = data[39];
        let mut offset = 40;
        let mut signing_key = None;

        for _ in 0..n_extensions {
            if offset + 4 > data.len() {
                return Err(TorError::InvalidCert("extension header truncated".into()));
            }
            let ext_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            let ext_type = data[offset + 2];
            let ext_data_start = offset + 4;
            if ext_data_start + ext_len > data.len() {
                return Err(TorError::InvalidCert("extension body truncated".into()));
            }

            // Extension type 4: signed-with-ed25519-key
            if ext_type == 4 && ext_len == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&data[ext_data_start..ext_data_start + 32]);
                signing_key = Some(key);
            }
            offset = ext_data_start + ext_len;
        }

        if data.len() < offset + 64 {
            return Err(TorError::InvalidCert("signature truncated".into()));
        }
        let sig_start = data.len() - 64;
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[sig_start..]);

        Ok(Self {
            cert_type,
            expiration_hours,
            certified_key,
            signing_key,
            raw_signed: data[..sig_start].to_vec(),
            signature,
        })
    }

    pub fn verify_signature(&self, signer: &[u8; 32]) -> Result<()> {
        let key = VerifyingKey::from_bytes(signer)
            .map_err(|e| TorError::InvalidCert(format!("bad signing key: {}", e)))?;
        let signature = Signature::from_bytes(&self.signature);
        key.verify(&self.raw_signed, &signature)
            .map_err(|e| TorError::InvalidCert(format!("Ed25519 signature invalid: {}", e)))
    }

    pub fn is_expired(&self) -> bool {
        let now_hours = (runtime::now_ms() / 1000 / 3600) as u32;
        self.expiration_hours < now_hours
    }
}

/// Validated link identities extracted from a CERTS cell.
#[derive(Debug, Clone)]
pub struct LinkIdentity {
    /// SHA-1 digest of the bridge's RSA identity key (DER)
    pub rsa_identity: [u8; 20],

    /// Ed25519 identity, when the bridge presents the modern chain
    pub ed25519_identity: Option<[u8; 32]>,
}

/// Validate a CERTS cell and extract the bridge identities.
///
/// The RSA identity certificate (type 2) is mandatory. When the Ed25519
/// chain is present (types 7 and 4), the signing-key certificate must carry
/// a valid, unexpired signature by the identity key.
pub fn validate_certs(cell: &CertsCell) -> Result<LinkIdentity> {
    let rsa_id_cert = cell
        .find(CertType::RsaId)
        .ok_or_else(|| TorError::InvalidCert("missing RSA identity certificate".into()))?;

    let rsa_identity = rsa_identity_digest(&rsa_id_cert.data)?;

    let mut ed25519_identity = None;
    if let Some(cross) = cell.find(CertType::Ed25519Identity) {
        // Cross-cert: ED25519_KEY (32) | EXPIRATION (4) | SIGLEN (1) | SIG
        if cross.data.len() < 37 {
            return Err(TorError::InvalidCert("cross-cert too short".into()));
        }
        let mut identity = [0u8; 32];
        identity.copy_from_slice(&cross.data[..32]);

        let expiration_hours =
            u32::from_be_bytes([cross.data[32], cross.data[33], cross.data[34], cross.data[35]]);
        let now_hours = (runtime::now_ms() / 1000 / 3600) as u32;
        if expiration_hours < now_hours {
            return Err(TorError::InvalidCert("RSA→Ed25519 cross-cert expired".into()));
        }

        if let Some(signing) = cell.find(CertType::Ed25519SigningKey) {
            let signing_cert = Ed25519Cert::parse(&signing.data)?;
            if signing_cert.is_expired() {
                return Err(TorError::InvalidCert("signing-key certificate expired".into()));
            }
            signing_cert.verify_signature(&identity)?;
        }

        ed25519_identity = Some(identity);
    }

    Ok(LinkIdentity {
        rsa_identity,
        ed25519_identity,
    })
}

/// SHA-1 of the DER-encoded RSA public key inside an X.509 certificate.
///
/// The walk follows the fixed tbsCertificate field order down to the
/// subjectPublicKeyInfo BIT STRING; anything off-pattern is rejected.
fn rsa_identity_digest(der: &[u8]) -> Result<[u8; 20]> {
    let cert = der_enter_sequence(der)?;
    let mut tbs = der_enter_sequence(cert)?;

    // Optional [0] EXPLICIT version
    if tbs.first() == Some(&0xa0) {
        tbs = der_skip(tbs)?;
    }
    // serialNumber, signature, issuer, validity, subject
    for _ in 0..5 {
        tbs = der_skip(tbs)?;
    }

    // subjectPublicKeyInfo ::= SEQUENCE { algorithm, subjectPublicKey }
    let spki = der_enter_sequence(tbs)?;
    let bit_string = der_skip(spki)?;
    let (tag, body, _) = der_read(bit_string)?;
    if tag != 0x03 || body.is_empty() {
        return Err(TorError::InvalidCert("malformed subjectPublicKey".into()));
    }

    // BIT STRING leads with the unused-bit count; the rest is the DER
    // RSAPublicKey, which is what the fingerprint covers.
    let mut hasher = Sha1::new();
    hasher.update(&body[1..]);
    Ok(hasher.finalize().into())
}

/// Read one DER TLV; returns (tag, value, rest).
fn der_read(data: &[u8]) -> Result<(u8, &[u8], &[u8])> {
    if data.len() < 2 {
        return Err(TorError::InvalidCert("DER element truncated".into()));
    }
    let tag = data[0];
    let (len, header) = match data[1] {
        n if n < 0x80 => (n as usize, 2),
        0x81 => {
            if data.len() < 3 {
                return Err(TorError::InvalidCert("DER length truncated".into()));
            }
            (data[2] as usize, 3)
        }
        0x82 => {
            if data.len() < 4 {
                return Err(TorError::InvalidCert("DER length truncated".into()));
            }
            (u16::from_be_bytes([data[2], data[3]]) as usize, 4)
        }
        _ => return Err(TorError::InvalidCert("unsupported DER length form".into())),
    };
    if data.len() < header + len {
        return Err(TorError::InvalidCert("DER value truncated".into()));
    }
    Ok((tag, &data[header..header + len], &data[header + len..]))
}

fn der_enter_sequence(data: &[u8]) -> Result<&[u8]> {
    let (tag, body, _) = der_read(data)?;
    if tag != 0x30 {
        return Err(TorError::InvalidCert(format!("expected SEQUENCE, got tag {:#x}", tag)));
    }
    Ok(body)
}

fn der_skip(data: &[u8]) -> Result<&[u8]> {
    let (_, _, rest) = der_read(data)?;
    Ok(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell_with(entries: &[(u8, &[u8])]) -> Vec<u8> {
        let mut payload = vec![entries.len() as u8];
        for (cert_type, data) in entries {
            payload.push(*cert_type);
            payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
            payload.extend_from_slice(data);
        }
        payload
    }

    #[test]
    fn parses_multi_cert_cell() {
        let payload = cell_with(&[(2, &[1, 2, 3]), (4, &[9; 104])]);
        let cell = CertsCell::parse(&payload).unwrap();
        assert_eq!(cell.certificates.len(), 2);
        assert_eq!(cell.certificates[0].cert_type, 2);
        assert_eq!(cell.certificates[1].data.len(), 104);
    }

    #[test]
    fn truncated_cell_rejected() {
        let mut payload = cell_with(&[(2, &[1, 2, 3])]);
        payload.truncate(payload.len() - 1);
        assert!(CertsCell::parse(&payload).is_err());
    }

    #[test]
    fn der_walk_basics() {
        // SEQUENCE { INTEGER 5 }
        let der = [0x30, 0x03, 0x02, 0x01, 0x05];
        let body = der_enter_sequence(&der).unwrap();
        let (tag, value, rest) = der_read(body).unwrap();
        assert_eq!(tag, 0x02);
        assert_eq!(value, &[5]);
        assert!(rest.is_empty());
    }

    #[test]
    fn missing_rsa_identity_is_invalid() {
        let payload = cell_with(&[(4, &[9; 104])]);
        let cell = CertsCell::parse(&payload).unwrap();
        assert!(validate_certs(&cell).is_err());
    }

    #[test]
    fn ed25519_cert_parse_rejects_bad_version() {
        let mut data = vec![0u8; 104];
        data[0] = 0x02;
        assert!(Ed25519Cert::parse(&data).is_err());
    }
}
