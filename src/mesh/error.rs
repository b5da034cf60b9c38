//! Mesh Module Error Types
//!
//! This module defines the error families raised by the mesh transport,
//! the secure channel and peer address handling.

use crate::platform::RadioError;

/// Errors raised while framing, validating or sending radio packets.
///
/// `LengthMismatch` and `AuthenticationFailure` are never reported back to the
/// sender; the receive path counts them and drops the packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Received buffer is not exactly one wire packet long
    #[error("packet length {0} does not match wire size {1}")]
    LengthMismatch(usize, usize),

    /// MAC over the header and payload did not verify
    #[error("packet authentication failed")]
    AuthenticationFailure,

    /// Logical message needs more fragments than the header can count
    #[error("message of {0} bytes exceeds maximum {1} bytes")]
    MessageTooLarge(usize, usize),

    /// Operation requires a started transport
    #[error("mesh transport is not active")]
    NotActive,

    /// Transport was already started; a restart is required to change role
    #[error("mesh transport is already active")]
    AlreadyActive,

    /// Radio refused an operation
    #[error(transparent)]
    Radio(#[from] RadioError),
}

/// Errors raised by the secure channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Tag did not authenticate the ciphertext
    #[error("decryption failed")]
    DecryptionFailed,

    /// No mesh root key is stored; nothing secure can proceed
    #[error("mesh root key is not set")]
    KeyUnavailable,

    /// Key material has the wrong shape
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Plaintext does not fit into a single packet once framed
    #[error("command of {0} bytes exceeds maximum {1} bytes")]
    CommandTooLarge(usize, usize),
}

/// Errors raised while validating mesh configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Text is not six colon separated hex octets
    #[error("malformed peer address: {0:?}")]
    MalformedAddress(String),

    /// All-zero and broadcast addresses cannot name a peer
    #[error("reserved peer address: {0}")]
    ReservedAddress(String),

    /// Channel is outside the radio's channel plan
    #[error("invalid mesh channel: {0}")]
    InvalidChannel(String),
}
