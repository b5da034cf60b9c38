//! Host platform
//!
//! Collaborators for running a node on a development machine. There is no
//! radio hardware, so sends are logged, and device effects such as restart
//! or deep sleep are logged instead of performed.

use serde_json::json;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{
    FirmwareUpdate, FirmwareUpdater, OtaError, Radio, RadioError, SystemControl, TelemetrySource,
};
use crate::mesh::packet::PACKET_SIZE;
use crate::mesh::peers::PeerAddress;
use crate::mesh::transport::Role;

/// Radio that only logs what it would transmit
#[derive(Debug, Default)]
pub struct LoggingRadio {
    sent: u64,
}

impl LoggingRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl Radio for LoggingRadio {
    fn init(&mut self, role: Role, channel: u8) -> Result<(), RadioError> {
        info!(target: "mesh", "host radio up as {} on channel {}", role, channel);
        Ok(())
    }

    fn register_peer(&mut self, address: &PeerAddress, channel: u8) -> Result<(), RadioError> {
        debug!(target: "mesh", "host radio peer {} on channel {}", address, channel);
        Ok(())
    }

    fn send(
        &mut self,
        destination: &PeerAddress,
        packet: &[u8; PACKET_SIZE],
    ) -> Result<(), RadioError> {
        self.sent += 1;
        trace!(
            target: "mesh",
            "host radio send to {}: {}",
            destination,
            hex::encode(packet)
        );
        Ok(())
    }
}

/// Device effects on a host
#[derive(Debug, Default)]
pub struct HostSystem;

impl SystemControl for HostSystem {
    fn restart(&mut self, reason: &str) {
        info!(target: "node", "restart requested: {}", reason);
    }

    fn deep_sleep(&mut self, period: Duration) {
        info!(target: "node", "deep sleep requested for {}s", period.as_secs());
    }

    fn start_network_scan(&mut self) {
        info!(target: "node", "network scan requested, no scanner on this host");
    }
}

/// Firmware updates cannot be flashed on a host.
#[derive(Debug, Default)]
pub struct HostUpdater;

impl FirmwareUpdater for HostUpdater {
    fn install(&mut self, update: &FirmwareUpdate) -> Result<(), OtaError> {
        match &update.ssid {
            Some(ssid) => debug!(
                target: "ota",
                "would join {:?} within {}s",
                ssid,
                update.connect_timeout.as_secs()
            ),
            None => debug!(target: "ota", "using current connection"),
        }

        info!(
            target: "ota",
            "firmware is {} bytes with checksum {} from {}",
            update.length,
            update.checksum,
            update.url
        );

        Err(OtaError::Failed(
            "firmware installation is not supported on this host".to_string(),
        ))
    }
}

/// Host readings: there are no sensors, so only uptime is reported.
#[derive(Debug)]
pub struct HostTelemetry {
    started: Instant,
}

impl HostTelemetry {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for HostTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for HostTelemetry {
    fn sample(&mut self) -> Option<serde_json::Value> {
        Some(json!({ "Uptime": self.started.elapsed().as_secs() }))
    }
}

/// Forward lines from `reader` as serial input.
///
/// The channel closes when the reader reaches end of input.
pub fn spawn_line_reader<R>(reader: R, depth: usize) -> mpsc::Receiver<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(depth.max(1));

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "node", "serial read failed: {}", e);
                    break;
                }
            }
        }
        debug!(target: "node", "serial reader finished");
    });

    rx
}
