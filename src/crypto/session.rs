//! Session ciphers.
//!
//! One 32-byte key per session drives both cipher modes: AES-256-GCM for
//! discrete control frames (fresh 12-byte IV per frame, 16-byte tag) and
//! AES-256-CTR for file streams (fresh 16-byte IV per transfer, integrity
//! via the end-of-transfer SHA-256 comparison).

use crate::error::{Error, Result};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use ctr::cipher::{KeyIvInit, StreamCipher as _};
use rand_core::{OsRng, RngCore};
use std::sync::Arc;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub const GCM_IV_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;
pub const CTR_IV_LEN: usize = 16;

/// A GCM-sealed control frame: ciphertext with the tag split off.
#[derive(Debug, Clone)]
pub struct SealedFrame {
    pub iv: [u8; GCM_IV_LEN],
    pub tag: [u8; GCM_TAG_LEN],
    pub ciphertext: Vec<u8>,
}

/// Symmetric crypto state of one established session. Cheap to clone; the
/// key is shared, cipher instances are constructed per use.
#[derive(Clone)]
pub struct SessionCrypto {
    key: Arc<[u8; 32]>,
}

impl SessionCrypto {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key: Arc::new(key) }
    }

    /// Seal a control-frame plaintext with AES-256-GCM under a fresh IV.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedFrame> {
        let mut iv = [0u8; GCM_IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let cipher = Aes256Gcm::new_from_slice(&*self.key)
            .map_err(|_| Error::Decryption("invalid session key".to_string()))?;

        // aes-gcm appends the 16-byte tag to the ciphertext
        let mut ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Decryption("encryption failed".to_string()))?;

        if ciphertext.len() < GCM_TAG_LEN {
            return Err(Error::Decryption("ciphertext too short".to_string()));
        }
        let tag_bytes = ciphertext.split_off(ciphertext.len() - GCM_TAG_LEN);
        let mut tag = [0u8; GCM_TAG_LEN];
        tag.copy_from_slice(&tag_bytes);

        Ok(SealedFrame {
            iv,
            tag,
            ciphertext,
        })
    }

    /// Open a sealed control frame, verifying the authentication tag.
    pub fn open(&self, sealed: &SealedFrame) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(&sealed.iv);

        let cipher = Aes256Gcm::new_from_slice(&*self.key)
            .map_err(|_| Error::Decryption("invalid session key".to_string()))?;

        let mut ciphertext = sealed.ciphertext.clone();
        ciphertext.extend_from_slice(&sealed.tag);

        cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| Error::Decryption("authentication tag mismatch".to_string()))
    }

    /// Fresh CTR cipher for an outgoing file stream. The IV travels in the
    /// clear once, in the stream header.
    pub fn stream_encryptor(&self) -> (StreamCipher, [u8; CTR_IV_LEN]) {
        let mut iv = [0u8; CTR_IV_LEN];
        OsRng.fill_bytes(&mut iv);
        (self.stream_cipher(&iv), iv)
    }

    /// CTR cipher for an incoming file stream, keyed by the sender's IV.
    pub fn stream_decryptor(&self, iv: &[u8; CTR_IV_LEN]) -> StreamCipher {
        self.stream_cipher(iv)
    }

    fn stream_cipher(&self, iv: &[u8; CTR_IV_LEN]) -> StreamCipher {
        // key and iv lengths are fixed by construction
        let cipher = Aes256Ctr::new_from_slices(&*self.key, iv).expect("fixed-length key and iv");
        StreamCipher { cipher }
    }
}

/// Streaming AES-256-CTR cipher; the same operation encrypts and decrypts.
pub struct StreamCipher {
    cipher: Aes256Ctr,
}

impl StreamCipher {
    /// Apply the keystream in place. Callable repeatedly across chunks.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }
}
