//! Command envelopes
//!
//! A command arrives either as plaintext or as an encrypted frame:
//!
//! ```text
//! | 'e' | nonce (12) | tag (16) | ciphertext (1 - 222) |
//! ```
//!
//! Either form may be preceded by a `dst-XXXXXXXXXXXX` destination marker.
//! A frame that decrypts is trusted no matter which input it came from.

use tracing::debug;
use zeroize::Zeroizing;

use crate::mesh::crypto::{KeyRing, ENCRYPTED_MARKER, NONCE_SIZE, TAG_SIZE};
use crate::mesh::error::CryptoError;
use crate::mesh::packet::PACKET_SIZE;
use crate::mesh::transport::strip_destination;
use crate::platform::ConfigStore;

/// Largest ciphertext accepted in an encrypted frame
pub const MAX_CIPHERTEXT: usize = PACKET_SIZE - NONCE_SIZE - TAG_SIZE;

const FRAME_OVERHEAD: usize = 1 + NONCE_SIZE + TAG_SIZE;

/// How far a command can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    /// Local serial input or a frame that decrypted
    Secure,
    /// Radio or broker plaintext
    Insecure,
}

impl Trust {
    pub fn from_flag(trusted: bool) -> Self {
        if trusted {
            Trust::Secure
        } else {
            Trust::Insecure
        }
    }

    pub fn is_secure(&self) -> bool {
        *self == Trust::Secure
    }
}

/// A command body ready to be parsed
#[derive(Debug)]
pub struct Envelope {
    pub body: Zeroizing<Vec<u8>>,
    pub trust: Trust,
}

/// Borrowed view of an encrypted frame
struct EncryptedFrame<'a> {
    nonce: [u8; NONCE_SIZE],
    tag: [u8; TAG_SIZE],
    ciphertext: &'a [u8],
}

impl<'a> EncryptedFrame<'a> {
    /// `None` if `raw` is not a well formed encrypted frame.
    fn split(raw: &'a [u8]) -> Option<Self> {
        if raw.first() != Some(&ENCRYPTED_MARKER) || raw.len() <= FRAME_OVERHEAD {
            return None;
        }

        let ciphertext = &raw[FRAME_OVERHEAD..];
        if ciphertext.len() > MAX_CIPHERTEXT {
            return None;
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&raw[1..1 + NONCE_SIZE]);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&raw[1 + NONCE_SIZE..FRAME_OVERHEAD]);

        Some(Self {
            nonce,
            tag,
            ciphertext,
        })
    }
}

/// True if `raw` has the shape of an encrypted frame.
pub fn is_encrypted(raw: &[u8]) -> bool {
    EncryptedFrame::split(strip_destination(raw)).is_some()
}

impl Envelope {
    /// Unwrap a raw command.
    ///
    /// Fails with [`CryptoError::DecryptionFailed`] if the frame does not
    /// authenticate, or [`CryptoError::KeyUnavailable`] if no root key is
    /// stored.
    pub fn open(
        raw: &[u8],
        trusted: bool,
        keys: &mut KeyRing,
        store: &dyn ConfigStore,
    ) -> Result<Self, CryptoError> {
        let raw = strip_destination(raw);

        let Some(frame) = EncryptedFrame::split(raw) else {
            return Ok(Self {
                body: Zeroizing::new(raw.to_vec()),
                trust: Trust::from_flag(trusted),
            });
        };

        debug!(target: "crypto", "decrypting {} byte command", frame.ciphertext.len());

        let channel = keys.load(store)?;
        let plaintext = channel.decrypt(frame.ciphertext, &frame.nonce, &frame.tag)?;

        Ok(Self {
            body: Zeroizing::new(strip_destination(&plaintext).to_vec()),
            trust: Trust::Secure,
        })
    }
}
