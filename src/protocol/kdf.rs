//! Key derivation for circuit hops
//!
//! Two derivations feed hop key material:
//!
//! - **KDF-TOR** (CREATE_FAST): iterated SHA-1 over `K0 ∥ counter`, yielding
//!   the key-hash check value followed by Df, Db, Kf, Kb.
//! - **ntor expansion** (EXTEND2): HKDF-SHA256 expand of the ntor KEY_SEED
//!   with the protocol's `m_expand` label, yielding Df, Db, Kf, Kb.

use hkdf::Hkdf;
use sha1::{Digest as _, Sha1};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, TorError};

const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Symmetric key material for one hop.
///
/// Digest seeds initialize the running SHA-1 hashers; keys drive the
/// AES-128-CTR keystreams (zero IV, counter persists across cells).
/// Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    /// Forward digest seed Df (client → relay)
    pub forward_digest: [u8; 20],

    /// Backward digest seed Db (relay → client)
    pub backward_digest: [u8; 20],

    /// Forward AES-128 key Kf
    pub forward_key: [u8; 16],

    /// Backward AES-128 key Kb
    pub backward_key: [u8; 16],
}

/// KDF-TOR output for CREATE_FAST: the verification hash plus hop keys.
pub struct FastKeyMaterial {
    pub key_hash: [u8; 20],
    pub keys: HopKeys,
}

/// KDF-TOR: expand `k0` into `out.len()` bytes via SHA-1 of `k0 ∥ [i]` for
/// an incrementing one-byte counter.
fn kdf_tor(k0: &[u8], out: &mut [u8]) {
    let mut written = 0;
    let mut counter = 0u8;
    while written < out.len() {
        let mut hasher = Sha1::new();
        hasher.update(k0);
        hasher.update([counter]);
        let block = hasher.finalize();

        let take = (out.len() - written).min(block.len());
        out[written..written + take].copy_from_slice(&block[..take]);
        written += take;
        counter += 1;
    }
}

/// Derive CREATE_FAST key material from `K0 = X ∥ Y`.
pub fn derive_fast_keys(x: &[u8; 20], y: &[u8; 20]) -> FastKeyMaterial {
    let mut k0 = [0u8; 40];
    k0[..20].copy_from_slice(x);
    k0[20..].copy_from_slice(y);

    // KH (20) | Df (20) | Db (20) | Kf (16) | Kb (16) = 92 bytes
    let mut okm = [0u8; 92];
    kdf_tor(&k0, &mut okm);
    k0.zeroize();

    let mut material = FastKeyMaterial {
        key_hash: [0u8; 20],
        keys: HopKeys {
            forward_digest: [0u8; 20],
            backward_digest: [0u8; 20],
            forward_key: [0u8; 16],
            backward_key: [0u8; 16],
        },
    };
    material.key_hash.copy_from_slice(&okm[0..20]);
    material.keys.forward_digest.copy_from_slice(&okm[20..40]);
    material.keys.backward_digest.copy_from_slice(&okm[40..60]);
    material.keys.forward_key.copy_from_slice(&okm[60..76]);
    material.keys.backward_key.copy_from_slice(&okm[76..92]);
    okm.zeroize();

    material
}

/// Expand an ntor KEY_SEED into hop keys.
///
/// KEY_SEED is already an HMAC output, so it is used directly as the HKDF
/// PRK and only the expand step runs.
pub fn derive_ntor_keys(key_seed: &[u8; 32]) -> Result<HopKeys> {
    let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
        .map_err(|_| TorError::Internal("invalid ntor PRK length".into()))?;

    // Df (20) | Db (20) | Kf (16) | Kb (16) = 72 bytes
    let mut okm = [0u8; 72];
    hkdf.expand(M_EXPAND, &mut okm)
        .map_err(|_| TorError::Internal("ntor key expansion failed".into()))?;

    let mut keys = HopKeys {
        forward_digest: [0u8; 20],
        backward_digest: [0u8; 20],
        forward_key: [0u8; 16],
        backward_key: [0u8; 16],
    };
    keys.forward_digest.copy_from_slice(&okm[0..20]);
    keys.backward_digest.copy_from_slice(&okm[20..40]);
    keys.forward_key.copy_from_slice(&okm[40..56]);
    keys.backward_key.copy_from_slice(&okm[56..72]);
    okm.zeroize();

    Ok(keys)
}
