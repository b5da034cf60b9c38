//! In-memory collaborators for tests
//!
//! Each double is cheap to clone and every clone shares the same log, so a
//! test can hand one copy to the node and inspect another afterwards.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::mesh::packet::PACKET_SIZE;
use crate::mesh::peers::PeerAddress;
use crate::mesh::transport::Role;
use crate::platform::{
    BrokerBridge, BrokerError, FirmwareUpdate, FirmwareUpdater, OtaError, Radio, RadioError,
    SystemControl, TelemetrySource,
};

pub use crate::platform::MemoryStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct RadioLog {
    initialized: Vec<(Role, u8)>,
    registered: Vec<(PeerAddress, u8)>,
    sent: Vec<(PeerAddress, [u8; PACKET_SIZE])>,
    fail_init: bool,
    fail_registration: bool,
    fail_send: bool,
}

/// Radio that records every call
#[derive(Debug, Clone, Default)]
pub struct RecordingRadio {
    log: Arc<Mutex<RadioLog>>,
}

impl RecordingRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_init(&self, fail: bool) {
        lock(&self.log).fail_init = fail;
    }

    pub fn fail_registration(&self, fail: bool) {
        lock(&self.log).fail_registration = fail;
    }

    pub fn fail_send(&self, fail: bool) {
        lock(&self.log).fail_send = fail;
    }

    pub fn initialized(&self) -> Vec<(Role, u8)> {
        lock(&self.log).initialized.clone()
    }

    /// Peers registered with the radio, with their channel
    pub fn registered(&self) -> Vec<(PeerAddress, u8)> {
        lock(&self.log).registered.clone()
    }

    /// Packets submitted, in order
    pub fn sent(&self) -> Vec<(PeerAddress, [u8; PACKET_SIZE])> {
        lock(&self.log).sent.clone()
    }

    pub fn clear_sent(&self) {
        lock(&self.log).sent.clear();
    }
}

impl Radio for RecordingRadio {
    fn init(&mut self, role: Role, channel: u8) -> Result<(), RadioError> {
        let mut log = lock(&self.log);
        if log.fail_init {
            return Err(RadioError::Init("scripted failure".to_string()));
        }
        log.initialized.push((role, channel));
        Ok(())
    }

    fn register_peer(&mut self, address: &PeerAddress, channel: u8) -> Result<(), RadioError> {
        let mut log = lock(&self.log);
        if log.fail_registration {
            return Err(RadioError::Registration(address.to_string()));
        }
        log.registered.push((*address, channel));
        Ok(())
    }

    fn send(
        &mut self,
        destination: &PeerAddress,
        packet: &[u8; PACKET_SIZE],
    ) -> Result<(), RadioError> {
        let mut log = lock(&self.log);
        if log.fail_send {
            return Err(RadioError::Send(destination.to_string()));
        }
        log.sent.push((*destination, *packet));
        Ok(())
    }
}

/// A message handed to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Published {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Debug, Default)]
struct BrokerLog {
    connected: bool,
    published: Vec<Published>,
}

/// Broker bridge that records publishes
#[derive(Debug, Clone, Default)]
pub struct RecordingBroker {
    log: Arc<Mutex<BrokerLog>>,
}

impl RecordingBroker {
    /// A connected broker
    pub fn new() -> Self {
        let broker = Self::default();
        broker.set_connected(true);
        broker
    }

    pub fn set_connected(&self, connected: bool) {
        lock(&self.log).connected = connected;
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.log).published.clone()
    }

    /// Publishes on one topic
    pub fn on_topic(&self, topic: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .collect()
    }
}

impl BrokerBridge for RecordingBroker {
    fn is_connected(&self) -> bool {
        lock(&self.log).connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BrokerError> {
        let mut log = lock(&self.log);
        if !log.connected {
            return Err(BrokerError::NotConnected);
        }
        log.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SystemLog {
    restarts: Vec<String>,
    sleeps: Vec<Duration>,
    scans: usize,
}

/// System control that records effects instead of performing them
#[derive(Debug, Clone, Default)]
pub struct RecordingSystem {
    log: Arc<Mutex<SystemLog>>,
}

impl RecordingSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reasons given for each restart
    pub fn restarts(&self) -> Vec<String> {
        lock(&self.log).restarts.clone()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.log).sleeps.clone()
    }

    pub fn scans(&self) -> usize {
        lock(&self.log).scans
    }
}

impl SystemControl for RecordingSystem {
    fn restart(&mut self, reason: &str) {
        lock(&self.log).restarts.push(reason.to_string());
    }

    fn deep_sleep(&mut self, period: Duration) {
        lock(&self.log).sleeps.push(period);
    }

    fn start_network_scan(&mut self) {
        lock(&self.log).scans += 1;
    }
}

#[derive(Debug, Default)]
struct UpdaterLog {
    attempts: Vec<FirmwareUpdate>,
    outcome: Option<String>,
}

/// Firmware updater with a fixed outcome
#[derive(Debug, Clone, Default)]
pub struct ScriptedUpdater {
    log: Arc<Mutex<UpdaterLog>>,
}

impl ScriptedUpdater {
    /// Every install fails with `reason`
    pub fn failing(reason: &str) -> Self {
        let updater = Self::default();
        lock(&updater.log).outcome = Some(reason.to_string());
        updater
    }

    /// Every install returns without error
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> Vec<FirmwareUpdate> {
        lock(&self.log).attempts.clone()
    }
}

impl FirmwareUpdater for ScriptedUpdater {
    fn install(&mut self, update: &FirmwareUpdate) -> Result<(), OtaError> {
        let mut log = lock(&self.log);
        log.attempts.push(update.clone());
        match &log.outcome {
            Some(reason) => Err(OtaError::Failed(reason.clone())),
            None => Ok(()),
        }
    }
}

/// Telemetry source returning the same reading every time
#[derive(Debug, Clone)]
pub struct FixedTelemetry(pub serde_json::Value);

impl TelemetrySource for FixedTelemetry {
    fn sample(&mut self) -> Option<serde_json::Value> {
        Some(self.0.clone())
    }
}
