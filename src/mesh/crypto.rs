//! Secure channel for mesh traffic
//!
//! All nodes in a mesh share one root key. Packets are authenticated with
//! HMAC-SHA256 keyed by the root key, and commands can additionally be sealed
//! with ChaCha20-Poly1305 under a key derived from it:
//!
//! ```text
//! encryption key = HMAC-SHA256(key = root key, message = "chacha-symmetric-key")
//! ```
//!
//! An encrypted command travels as `e || nonce(12) || tag(16) || ciphertext`.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use tracing::{debug, error, trace, warn};
use zeroize::{Zeroize, Zeroizing};

use super::error::CryptoError;
use super::packet::PAYLOAD_SIZE;
use crate::platform::{ConfigKey, ConfigStore};

type HmacSha256 = Hmac<Sha256>;

/// Size of a packet MAC
pub const MAC_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Leading byte of an encrypted command frame
pub const ENCRYPTED_MARKER: u8 = b'e';

/// Label the encryption key is derived from
pub const ENCRYPTION_KEY_LABEL: &[u8] = b"chacha-symmetric-key";

/// Largest plaintext whose frame still fits one packet payload
pub const MAX_SEALED_PLAINTEXT: usize = PAYLOAD_SIZE - 1 - NONCE_SIZE - TAG_SIZE;

/// A packet authentication code
pub type MacTag = [u8; MAC_SIZE];

/// Symmetric keys derived from the mesh root key.
pub struct SecureChannel {
    mac_key: Zeroizing<Vec<u8>>,
    encryption_key: Zeroizing<[u8; 32]>,
}

impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel").finish_non_exhaustive()
    }
}

impl SecureChannel {
    /// Derive both keys from a root secret.
    ///
    /// An empty root key means the node was never given one.
    pub fn new(root_key: &[u8]) -> Result<Self, CryptoError> {
        if root_key.is_empty() {
            return Err(CryptoError::KeyUnavailable);
        }

        let encryption_key = Zeroizing::new(hmac_sha256(root_key, ENCRYPTION_KEY_LABEL)?);

        Ok(Self {
            mac_key: Zeroizing::new(root_key.to_vec()),
            encryption_key,
        })
    }

    /// Load the root key from the store and derive the channel keys.
    pub fn from_store(store: &dyn ConfigStore) -> Result<Self, CryptoError> {
        let root_key = match store.read(ConfigKey::MeshKey) {
            Ok(Some(key)) => Zeroizing::new(key),
            Ok(None) => Zeroizing::new(Vec::new()),
            Err(e) => {
                warn!(target: "crypto", "unable to read mesh key: {}", e);
                Zeroizing::new(Vec::new())
            }
        };

        let channel = Self::new(&root_key)?;
        debug!(target: "crypto", "derived mesh keys");
        Ok(channel)
    }

    /// HMAC-SHA256 of `data` keyed by the root key.
    pub fn mac(&self, data: &[u8]) -> MacTag {
        // HMAC accepts keys of any length and the key was checked to be
        // non-empty at construction.
        hmac_sha256(&self.mac_key, data).unwrap_or([0u8; MAC_SIZE])
    }

    /// Authenticate and decrypt `buffer` in place.
    ///
    /// On failure the buffer is zeroed before returning, so unauthenticated
    /// plaintext is never observable.
    pub fn decrypt_in_place(
        &self,
        buffer: &mut [u8],
        nonce: &[u8; NONCE_SIZE],
        tag: &[u8; TAG_SIZE],
    ) -> Result<(), CryptoError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.encryption_key.as_slice()));

        let result = cipher.decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            b"",
            buffer,
            Tag::from_slice(tag),
        );

        if result.is_err() {
            buffer.zeroize();
            return Err(CryptoError::DecryptionFailed);
        }

        Ok(())
    }

    /// Decrypt a detached ciphertext into a fresh buffer.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
        tag: &[u8; TAG_SIZE],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let mut buffer = Zeroizing::new(ciphertext.to_vec());
        self.decrypt_in_place(&mut buffer, nonce, tag)?;
        Ok(buffer)
    }

    /// Seal a command with a fresh random nonce.
    ///
    /// Receivers strip trailing zero padding from packet payloads, so the
    /// nonce is redrawn until the frame ends in a non-zero byte.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedCommand, CryptoError> {
        loop {
            let sealed = self.encrypt_with_nonce(plaintext, rand::random::<[u8; NONCE_SIZE]>())?;
            if !sealed.ends_in_zero() {
                return Ok(sealed);
            }
            trace!(target: "crypto", "frame ends in a zero byte, resealing");
        }
    }

    /// Seal a command with a caller supplied nonce.
    ///
    /// Nonces must never repeat under the same key.
    pub fn encrypt_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: [u8; NONCE_SIZE],
    ) -> Result<EncryptedCommand, CryptoError> {
        if plaintext.len() > MAX_SEALED_PLAINTEXT {
            return Err(CryptoError::CommandTooLarge(
                plaintext.len(),
                MAX_SEALED_PLAINTEXT,
            ));
        }

        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.encryption_key.as_slice()));
        let mut ciphertext = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut ciphertext)
            .map_err(|_| {
                error!(target: "crypto", "encryption failed");
                CryptoError::InvalidKey("cipher rejected input".to_string())
            })?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(tag.as_slice());

        Ok(EncryptedCommand {
            nonce,
            tag: tag_bytes,
            ciphertext,
        })
    }
}

/// A sealed command ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedCommand {
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
    pub ciphertext: Vec<u8>,
}

impl EncryptedCommand {
    /// True if the last frame byte is zero and would be lost to padding.
    pub fn ends_in_zero(&self) -> bool {
        let last = self.ciphertext.last().or(self.tag.last());
        last == Some(&0)
    }

    /// Render as `e || nonce || tag || ciphertext`.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + NONCE_SIZE + TAG_SIZE + self.ciphertext.len());
        frame.push(ENCRYPTED_MARKER);
        frame.extend_from_slice(&self.nonce);
        frame.extend_from_slice(&self.tag);
        frame.extend_from_slice(&self.ciphertext);
        frame
    }
}

/// Lazily loaded channel keys.
///
/// The root key is read on first use and cached until the process restarts.
#[derive(Debug, Default)]
pub struct KeyRing {
    channel: Option<SecureChannel>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an already derived channel.
    pub fn with_channel(channel: SecureChannel) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    /// Return the cached channel, deriving it from the store on first use.
    pub fn load(&mut self, store: &dyn ConfigStore) -> Result<&SecureChannel, CryptoError> {
        if self.channel.is_none() {
            self.channel = Some(SecureChannel::from_store(store)?);
        }

        self.channel.as_ref().ok_or(CryptoError::KeyUnavailable)
    }

    pub fn is_loaded(&self) -> bool {
        self.channel.is_some()
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<MacTag, CryptoError> {
    let mut hmac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    hmac.update(data);

    let mut out = [0u8; MAC_SIZE];
    out.copy_from_slice(&hmac.finalize().into_bytes());
    Ok(out)
}

/// Compare two MACs in constant time.
///
/// Every byte is inspected regardless of where the first difference is.
pub fn mac_equal(lhs: &MacTag, rhs: &MacTag) -> bool {
    let mut inspected = 0;
    mac_equal_counted(lhs, rhs, &mut inspected)
}

fn mac_equal_counted(lhs: &MacTag, rhs: &MacTag, inspected: &mut usize) -> bool {
    let mut diff = 0u8;
    for (l, r) in lhs.iter().zip(rhs.iter()) {
        diff |= l ^ r;
        *inspected += 1;
    }

    std::hint::black_box(diff) == 0
}
