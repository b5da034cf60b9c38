//! Platform collaborators
//!
//! The mesh core never talks to hardware directly. Everything it needs from
//! the device is expressed as a narrow trait here:
//!
//! - [`ConfigStore`]: named-value persistence
//! - [`Radio`]: connectionless point-to-point send and the radio peer table
//! - [`BrokerBridge`]: publish to the central broker (controller only)
//! - [`SystemControl`]: restart, deep sleep and Wi-Fi scans
//! - [`FirmwareUpdater`]: over-the-air firmware installation
//! - [`TelemetrySource`]: sensor readings published periodically
//!
//! Radio notifications arrive outside the main loop. They are queued through
//! [`RadioEvents`] and drained by the node, which is the only writer of
//! shared mesh state.

pub mod host;
pub mod store;

pub use store::{ConfigKey, ConfigStore, FileStore, MemoryStore, StoreError};

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::mesh::packet::PACKET_SIZE;
use crate::mesh::peers::PeerAddress;
use crate::mesh::transport::Role;

/// Radio failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RadioError {
    #[error("radio initialization failed: {0}")]
    Init(String),

    #[error("peer registration failed: {0}")]
    Registration(String),

    #[error("send failed: {0}")]
    Send(String),
}

/// Connectionless point-to-point radio.
pub trait Radio: Send {
    /// Bring the radio up in the given role on a channel
    fn init(&mut self, role: Role, channel: u8) -> Result<(), RadioError>;

    /// Add an address to the radio's peer table
    fn register_peer(&mut self, address: &PeerAddress, channel: u8) -> Result<(), RadioError>;

    /// Submit one packet. Completion is reported later through
    /// [`RadioEvent::SendComplete`].
    fn send(&mut self, destination: &PeerAddress, packet: &[u8; PACKET_SIZE])
        -> Result<(), RadioError>;
}

/// Broker failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("publish to {0} failed")]
    Publish(String),
}

/// Publish side of the broker connection.
pub trait BrokerBridge: Send {
    fn is_connected(&self) -> bool;

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BrokerError>;
}

/// Device level effects.
pub trait SystemControl: Send {
    /// Reboot the device. On hardware this does not return.
    fn restart(&mut self, reason: &str);

    /// Enter low-power sleep for `period`
    fn deep_sleep(&mut self, period: Duration);

    /// Begin an asynchronous Wi-Fi scan
    fn start_network_scan(&mut self);
}

/// A firmware image to download and flash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareUpdate {
    /// Network to join for the download, if different from the current one
    pub ssid: Option<String>,
    pub password: Option<String>,
    pub url: String,
    pub length: u64,
    pub checksum: String,
    /// Upper bound on joining `ssid`
    pub connect_timeout: Duration,
}

/// Firmware update failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OtaError {
    #[error("{0}")]
    Failed(String),
}

/// Over-the-air updater.
pub trait FirmwareUpdater: Send {
    /// Download, verify and flash an image. Returning at all means the
    /// device did not reboot into the new image.
    fn install(&mut self, update: &FirmwareUpdate) -> Result<(), OtaError>;
}

/// Periodic sensor readings
pub trait TelemetrySource: Send {
    fn sample(&mut self) -> Option<serde_json::Value>;
}

/// Notification raised by the radio subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    Received { source: PeerAddress, data: Vec<u8> },
    SendComplete { destination: PeerAddress, success: bool },
}

/// Sending half of the radio notification queue.
///
/// Safe to call from the radio callback: it never blocks, and drops the
/// notification if the queue is full.
#[derive(Debug, Clone)]
pub struct RadioEvents {
    tx: mpsc::Sender<RadioEvent>,
}

impl RadioEvents {
    /// Create a queue holding at most `depth` pending notifications.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<RadioEvent>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    pub fn received(&self, source: PeerAddress, data: &[u8]) -> bool {
        self.push(RadioEvent::Received {
            source,
            data: data.to_vec(),
        })
    }

    pub fn send_complete(&self, destination: PeerAddress, success: bool) -> bool {
        self.push(RadioEvent::SendComplete {
            destination,
            success,
        })
    }

    fn push(&self, event: RadioEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(target: "mesh", "radio queue full, dropping notification");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
