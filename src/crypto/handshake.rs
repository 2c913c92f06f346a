//! Key agreement.
//!
//! Each TCP connection gets a fresh ephemeral X25519 key pair. Public keys
//! travel base64(SPKI/DER); the 32-byte session key is
//! `SHA-256(x25519(our_secret, peer_public))`. Keys live exactly as long as
//! the socket; a reconnect re-keys and nothing is persisted.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};

/// DER prefix of an X25519 SubjectPublicKeyInfo (RFC 8410); the raw 32-byte
/// key follows immediately.
const X25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

/// Encode a raw X25519 public key as base64(SPKI/DER).
pub fn encode_public_key(public: &PublicKey) -> String {
    let mut der = Vec::with_capacity(X25519_SPKI_PREFIX.len() + 32);
    der.extend_from_slice(&X25519_SPKI_PREFIX);
    der.extend_from_slice(public.as_bytes());
    BASE64.encode(der)
}

/// Decode a base64(SPKI/DER) X25519 public key, validating the DER prefix.
pub fn decode_public_key(encoded: &str) -> Result<PublicKey> {
    let der = BASE64
        .decode(encoded)
        .map_err(|e| Error::Handshake(format!("invalid public key encoding: {}", e)))?;

    let raw = der
        .strip_prefix(X25519_SPKI_PREFIX.as_slice())
        .ok_or_else(|| Error::Handshake("public key is not X25519 SPKI".to_string()))?;

    let bytes: [u8; 32] = raw
        .try_into()
        .map_err(|_| Error::Handshake(format!("invalid public key length: {}", raw.len())))?;

    Ok(PublicKey::from(bytes))
}

/// Ephemeral key pair for one connection. Consumed by the key agreement.
pub struct Keypair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Our public key, wire-encoded.
    pub fn public_spki(&self) -> String {
        encode_public_key(&self.public)
    }

    /// Complete the agreement against the peer's wire-encoded public key,
    /// yielding the 32-byte session key.
    pub fn agree(self, peer_spki: &str) -> Result<[u8; 32]> {
        let peer_public = decode_public_key(peer_spki)?;
        let shared = self.secret.diffie_hellman(&peer_public);
        let digest = Sha256::digest(shared.as_bytes());
        Ok(digest.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spki_roundtrip() {
        let kp = Keypair::generate();
        let encoded = kp.public_spki();
        let decoded = decode_public_key(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), kp.public.as_bytes());
    }

    #[test]
    fn test_spki_prefix_is_validated() {
        // Raw 32 bytes without the DER header must be rejected.
        let raw = BASE64.encode([0x42u8; 32]);
        assert!(decode_public_key(&raw).is_err());

        assert!(decode_public_key("not-base64!!!").is_err());

        // Truncated key material under a valid prefix.
        let mut der = X25519_SPKI_PREFIX.to_vec();
        der.extend_from_slice(&[0u8; 16]);
        assert!(decode_public_key(&BASE64.encode(der)).is_err());
    }

    #[test]
    fn test_both_sides_derive_the_same_key() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let alice_spki = alice.public_spki();
        let bob_spki = bob.public_spki();

        let alice_key = alice.agree(&bob_spki).unwrap();
        let bob_key = bob.agree(&alice_spki).unwrap();

        assert_eq!(alice_key, bob_key);
    }

    #[test]
    fn test_distinct_pairs_yield_distinct_keys() {
        let a1 = Keypair::generate();
        let a2 = Keypair::generate();
        let b = Keypair::generate();
        let b_spki = b.public_spki();

        let k1 = a1.agree(&b_spki).unwrap();
        let k2 = a2.agree(&b_spki).unwrap();
        assert_ne!(k1, k2);
    }
}
