//! ntor handshake (client side)
//!
//! One-way-authenticated X25519 key exchange used to extend a circuit by a
//! hop. The client sends `ID ∥ B ∥ X` inside EXTEND2; the relay answers with
//! `Y ∥ AUTH` inside EXTENDED2. AUTH is checked in constant time before any
//! key material is used.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

use super::kdf::{derive_ntor_keys, HopKeys};
use crate::error::{Result, TorError};

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";

type HmacSha256 = Hmac<Sha256>;

/// Length of the onion skin the client sends: ID (20) + B (32) + X (32)
pub const ONION_SKIN_LEN: usize = 84;

/// Length of the relay's reply: Y (32) + AUTH (32)
pub const SERVER_REPLY_LEN: usize = 64;

/// In-progress ntor handshake toward one relay.
pub struct NtorClient {
    secret: StaticSecret,
    public: PublicKey,
    node_id: [u8; 20],
    onion_key: PublicKey,
}

impl NtorClient {
    /// Start a handshake toward the relay identified by `node_id` (RSA
    /// fingerprint) with ntor onion key `onion_key`.
    pub fn new(node_id: [u8; 20], onion_key: PublicKey) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            node_id,
            onion_key,
        }
    }

    /// The client handshake data: `ID ∥ B ∥ X`.
    pub fn onion_skin(&self) -> [u8; ONION_SKIN_LEN] {
        let mut skin = [0u8; ONION_SKIN_LEN];
        skin[..20].copy_from_slice(&self.node_id);
        skin[20..52].copy_from_slice(self.onion_key.as_bytes());
        skin[52..].copy_from_slice(self.public.as_bytes());
        skin
    }

    /// Complete the handshake with the relay's `Y ∥ AUTH` reply, returning
    /// the new hop's key material.
    ///
    /// secret_input = EXP(Y,x) ∥ EXP(B,x) ∥ ID ∥ B ∥ X ∥ Y ∥ PROTOID
    pub fn finish(self, server_public: &PublicKey, server_auth: &[u8; 32]) -> Result<HopKeys> {
        let xy = self.secret.diffie_hellman(server_public);
        let xb = self.secret.diffie_hellman(&self.onion_key);

        let mut secret_input = Vec::with_capacity(32 + 32 + 20 + 32 + 32 + 32 + PROTOID.len());
        secret_input.extend_from_slice(xy.as_bytes());
        secret_input.extend_from_slice(xb.as_bytes());
        secret_input.extend_from_slice(&self.node_id);
        secret_input.extend_from_slice(self.onion_key.as_bytes());
        secret_input.extend_from_slice(self.public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac_over(T_KEY, &secret_input);
        let verify = hmac_over(T_VERIFY, &secret_input);

        // auth_input = verify ∥ ID ∥ B ∥ Y ∥ X ∥ PROTOID ∥ "Server"
        let mut auth_input = Vec::with_capacity(32 + 20 + 32 + 32 + 32 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.node_id);
        auth_input.extend_from_slice(self.onion_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        let computed_auth = hmac_over(T_MAC, &auth_input);

        let auth_ok: bool = computed_auth.as_slice().ct_eq(server_auth.as_slice()).into();
        if !auth_ok {
            return Err(TorError::ExtendFailed("ntor AUTH verification failed".into()));
        }

        derive_ntor_keys(&key_seed)
    }
}

fn hmac_over(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Parse the relay's CREATED2/EXTENDED2 handshake reply.
pub fn parse_server_reply(hdata: &[u8]) -> Result<(PublicKey, [u8; 32])> {
    if hdata.len() < SERVER_REPLY_LEN {
        return Err(TorError::ExtendFailed(format!(
            "ntor reply too short: {} bytes",
            hdata.len()
        )));
    }

    let mut public = [0u8; 32];
    public.copy_from_slice(&hdata[0..32]);

    let mut auth = [0u8; 32];
    auth.copy_from_slice(&hdata[32..64]);

    Ok((PublicKey::from(public), auth))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulate_server(
        skin: &[u8; ONION_SKIN_LEN],
        onion_secret: &StaticSecret,
    ) -> ([u8; 32], [u8; 32]) {
        // Relay side of ntor, used to exercise the client end to end.
        let node_id: [u8; 20] = skin[..20].try_into().unwrap();
        let b = PublicKey::from(onion_secret);
        let client_public = {
            let mut x = [0u8; 32];
            x.copy_from_slice(&skin[52..]);
            PublicKey::from(x)
        };

        let server_secret = StaticSecret::random_from_rng(OsRng);
        let server_public = PublicKey::from(&server_secret);

        let xy = server_secret.diffie_hellman(&client_public);
        let xb = onion_secret.diffie_hellman(&client_public);

        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(xy.as_bytes());
        secret_input.extend_from_slice(xb.as_bytes());
        secret_input.extend_from_slice(&node_id);
        secret_input.extend_from_slice(b.as_bytes());
        secret_input.extend_from_slice(client_public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let verify = hmac_over(T_VERIFY, &secret_input);

        let mut auth_input = Vec::new();
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&node_id);
        auth_input.extend_from_slice(b.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");

        (*server_public.as_bytes(), hmac_over(T_MAC, &auth_input))
    }

    #[test]
    fn onion_skin_layout() {
        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let client = NtorClient::new([9u8; 20], PublicKey::from(&onion_secret));

        let skin = client.onion_skin();
        assert_eq!(&skin[..20], &[9u8; 20]);
        assert_eq!(&skin[20..52], PublicKey::from(&onion_secret).as_bytes());
    }

    #[test]
    fn full_handshake_against_simulated_relay() {
        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let client = NtorClient::new([7u8; 20], PublicKey::from(&onion_secret));

        let skin = client.onion_skin();
        let (server_public, auth) = simulate_server(&skin, &onion_secret);

        let keys = client
            .finish(&PublicKey::from(server_public), &auth)
            .expect("handshake should verify");
        assert_ne!(keys.forward_key, keys.backward_key);
    }

    #[test]
    fn corrupted_auth_is_rejected() {
        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let client = NtorClient::new([7u8; 20], PublicKey::from(&onion_secret));

        let skin = client.onion_skin();
        let (server_public, mut auth) = simulate_server(&skin, &onion_secret);
        auth[0] ^= 0x01;

        assert!(client.finish(&PublicKey::from(server_public), &auth).is_err());
    }

    #[test]
    fn short_server_reply_rejected() {
        assert!(parse_server_reply(&[0u8; 63]).is_err());
        assert!(parse_server_reply(&[0u8; 64]).is_ok());
    }
}
