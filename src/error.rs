//! Node Error Types
//!
//! [`NodeError`] gathers every failure the node runtime can see. Most are
//! local to one command or one packet; the fatal ones end in a restart.

use crate::command::ProtocolError;
use crate::mesh::error::{ConfigError, CryptoError, TransportError};
use crate::platform::{BrokerError, OtaError, RadioError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("firmware update failed: {0}")]
    Ota(#[from] OtaError),

    /// Unrecoverable; the node must restart
    #[error("fatal: {0}")]
    Fatal(String),
}

impl NodeError {
    /// True if the node cannot continue without a restart.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NodeError::Fatal(_)
                | NodeError::Ota(_)
                | NodeError::Crypto(CryptoError::KeyUnavailable)
                | NodeError::Transport(TransportError::Radio(RadioError::Init(_)))
        )
    }
}
