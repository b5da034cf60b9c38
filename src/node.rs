//! Node runtime
//!
//! [`NodeContext`] owns everything a node knows for the lifetime of one boot:
//! its identity, the configuration store, the cached mesh keys, the mesh
//! transport and the platform collaborators. [`Node`] drives it:
//!
//! 1. setup mode until the store holds a complete configuration
//! 2. [`Node::start`]: choose a role, start the transport, load peers and
//!    announce the node
//! 3. [`Node::run`]: a single loop that is the only writer of node state
//!
//! The loop multiplexes serial lines, locally queued commands, radio
//! notifications, broker commands and the telemetry timer.

use serde_json::json;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::command::{is_complete, CommandRouter, Disposition};
use crate::error::NodeError;
use crate::mesh::crypto::KeyRing;
use crate::mesh::peers::PeerAddress;
use crate::mesh::transport::{Inbound, MeshTransport, Role, PACKET_TOPIC};
use crate::platform::{
    BrokerBridge, ConfigKey, ConfigStore, FirmwareUpdater, Radio, RadioEvent, SystemControl,
    TelemetrySource,
};

/// Root of every broker topic
pub const TOPIC_ROOT: &str = "garden/module";

/// Tele topic published retained under the discovery root
pub const DISCOVERY_TOPIC: &str = "discovery";

/// Tele topic for sensor readings
pub const DATA_TOPIC: &str = "data";

/// Firmware update limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaSettings {
    /// Declared image sizes at or below this are refused
    pub min_firmware_size: u64,
    /// Upper bound on joining the download network
    pub connect_timeout: Duration,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            min_firmware_size: 100_000,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Settings read from the store at boot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    pub role: Role,
    pub channel: u8,
    pub controller: String,
    pub wifi_ssid: String,
    pub mqtt_host: String,
    pub mqtt_username: String,
}

impl NodeSettings {
    /// A node is the controller iff no controller address is stored.
    pub fn load(store: &dyn ConfigStore) -> Self {
        let controller = store.read_string(ConfigKey::MeshController).trim().to_string();
        let role = if controller.is_empty() {
            Role::Controller
        } else {
            Role::Client
        };

        Self {
            role,
            channel: parse_channel(&store.read_string(ConfigKey::MeshChannel)),
            controller,
            wifi_ssid: store.read_string(ConfigKey::WifiSsid),
            mqtt_host: store.read_string(ConfigKey::MqttHost),
            mqtt_username: store.read_string(ConfigKey::MqttUsername),
        }
    }
}

fn parse_channel(raw: &str) -> u8 {
    let raw = raw.trim();
    if raw.is_empty() {
        debug!(target: "mesh", "using default channel of 1");
        return 1;
    }

    match raw.parse::<i64>() {
        Ok(channel) if channel > 0 && channel <= u8::MAX as i64 => {
            debug!(target: "mesh", "using mesh channel {}", channel);
            channel as u8
        }
        _ => {
            warn!(target: "mesh", "invalid mesh channel {:?}, defaulting to 1", raw);
            1
        }
    }
}

/// Per-boot node state.
pub struct NodeContext {
    pub identity: PeerAddress,
    pub store: Box<dyn ConfigStore>,
    pub keys: KeyRing,
    pub transport: MeshTransport,
    pub broker: Option<Box<dyn BrokerBridge>>,
    pub system: Box<dyn SystemControl>,
    pub updater: Box<dyn FirmwareUpdater>,
    pub ota: OtaSettings,
    pending: VecDeque<Vec<u8>>,
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("identity", &self.identity)
            .field("transport", &self.transport)
            .field("broker", &self.broker.is_some())
            .field("ota", &self.ota)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl NodeContext {
    pub fn new(
        identity: PeerAddress,
        store: Box<dyn ConfigStore>,
        radio: Box<dyn Radio>,
        system: Box<dyn SystemControl>,
        updater: Box<dyn FirmwareUpdater>,
        ota: OtaSettings,
    ) -> Self {
        Self {
            identity,
            store,
            keys: KeyRing::new(),
            transport: MeshTransport::new(identity, radio),
            broker: None,
            system,
            updater,
            ota,
            pending: VecDeque::new(),
        }
    }

    pub fn set_broker(&mut self, broker: Box<dyn BrokerBridge>) {
        self.broker = Some(broker);
    }

    /// Node identifier: the hardware address as 12 uppercase hex digits.
    pub fn identifier(&self) -> String {
        self.identity.identifier()
    }

    pub fn is_controller(&self) -> bool {
        self.transport.is_controller()
    }

    /// Topic the controller takes commands from
    pub fn command_topic(&self) -> String {
        format!("{}/{}/cmnd", TOPIC_ROOT, self.identifier())
    }

    /// Broker topic for a tele topic
    pub fn tele_topic(&self, tele_topic: &str) -> String {
        if tele_topic == DISCOVERY_TOPIC {
            format!("{}/{}/{}", TOPIC_ROOT, DISCOVERY_TOPIC, self.identifier())
        } else {
            format!("{}/{}/tele/{}", TOPIC_ROOT, self.identifier(), tele_topic)
        }
    }

    /// Queue a trusted local command for the next loop iteration.
    pub fn queue_command(&mut self, command: impl Into<Vec<u8>>) {
        self.pending.push_back(command.into());
    }

    fn next_queued(&mut self) -> Option<Vec<u8>> {
        self.pending.pop_front()
    }

    /// Run one command through the router.
    pub fn process(&mut self, raw: &[u8], trusted: bool) -> Result<Disposition, NodeError> {
        CommandRouter::new(self).process(raw, trusted)
    }

    /// Frame and broadcast a message over the mesh.
    pub fn publish_mesh(&mut self, payload: &[u8], topic: Option<&str>) -> Result<u8, NodeError> {
        let channel = self.keys.load(self.store.as_ref())?;
        Ok(self.transport.publish(channel, payload, topic)?)
    }

    /// Publish to the broker when connected, otherwise over the mesh with
    /// the broker topic as the mesh topic. Discovery is retained.
    pub fn publish(&mut self, data: &[u8], tele_topic: &str) -> Result<(), NodeError> {
        let topic = self.tele_topic(tele_topic);
        let retain = tele_topic == DISCOVERY_TOPIC;

        if let Some(broker) = self.broker.as_mut().filter(|b| b.is_connected()) {
            debug!(
                target: "node",
                "publishing {} bytes to {}. retain: {}",
                data.len(),
                topic,
                retain
            );
            broker.publish(&topic, data, retain)?;
            return Ok(());
        }

        self.publish_mesh(data, Some(&topic)).map(|_| ())
    }

    /// Rebuild peer membership from the store.
    pub fn reload_peers(&mut self) -> usize {
        let controller = self.store.read_string(ConfigKey::MeshController);
        let peers = self.store.read_string(ConfigKey::MeshPeers);
        self.transport.reload_peers(&controller, &peers)
    }

    /// Forward an authenticated mesh packet to the broker.
    fn forward_uplink(&mut self, packet: &[u8]) -> Result<(), NodeError> {
        let topic = self.tele_topic(PACKET_TOPIC);

        match self.broker.as_mut().filter(|b| b.is_connected()) {
            Some(broker) => {
                broker.publish(&topic, packet, false)?;
                Ok(())
            }
            None => {
                warn!(target: "mesh", "no broker connection, dropping mesh packet");
                Ok(())
            }
        }
    }

    fn handle_radio(&mut self, event: RadioEvent) -> Result<Disposition, NodeError> {
        match event {
            RadioEvent::SendComplete {
                destination,
                success,
            } => {
                self.transport.on_send_complete(&destination, success);
                Ok(Disposition::Continue)
            }
            RadioEvent::Received { source, data } => {
                let channel = self.keys.load(self.store.as_ref())?;

                match self.transport.on_receive(channel, &source, &data) {
                    Ok(Inbound::Uplink(packet)) => {
                        self.forward_uplink(&packet)?;
                        Ok(Disposition::Continue)
                    }
                    Ok(Inbound::Delivered {
                        command: Some(command),
                        ..
                    }) => self.process(&command, false),
                    Ok(Inbound::Delivered { command: None, .. }) => Ok(Disposition::Continue),
                    Err(e) => {
                        debug!(target: "mesh", "dropped packet from {}: {}", source, e);
                        Ok(Disposition::Continue)
                    }
                }
            }
        }
    }
}

/// Why the node loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shutdown {
    /// A restart was requested from the platform
    Restart(String),
    /// The node entered deep sleep
    Sleep(Duration),
    /// Every input closed
    InputClosed,
}

/// Input channels for the node loop
#[derive(Debug)]
pub struct NodeInputs {
    /// Lines typed on the serial console; trusted
    pub serial: mpsc::Receiver<String>,
    /// Radio notifications from [`crate::platform::RadioEvents`]
    pub radio: mpsc::Receiver<RadioEvent>,
    /// Payloads received on the command topic; untrusted
    pub broker: Option<mpsc::Receiver<Vec<u8>>>,
}

/// A mesh node.
pub struct Node {
    ctx: NodeContext,
    telemetry: Option<Box<dyn TelemetrySource>>,
    telemetry_interval: Duration,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("ctx", &self.ctx)
            .field("telemetry", &self.telemetry.is_some())
            .field("telemetry_interval", &self.telemetry_interval)
            .finish()
    }
}

impl Node {
    pub fn new(ctx: NodeContext) -> Self {
        Self {
            ctx,
            telemetry: None,
            telemetry_interval: Duration::from_secs(10),
        }
    }

    /// Publish sensor readings every `interval` on client nodes.
    pub fn with_telemetry(mut self, source: Box<dyn TelemetrySource>, interval: Duration) -> Self {
        self.telemetry = Some(source);
        self.telemetry_interval = interval;
        self
    }

    /// Publishing interval, if a telemetry source is attached.
    pub fn telemetry_interval(&self) -> Option<Duration> {
        self.telemetry.as_ref().map(|_| self.telemetry_interval)
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut NodeContext {
        &mut self.ctx
    }

    /// True if the configured marker is stored.
    pub fn is_configured(&self) -> bool {
        self.ctx.store.exists(ConfigKey::Configured)
    }

    /// Process trusted serial lines until the node is configured.
    ///
    /// With `force` set, keeps going until a command restarts the node or
    /// input ends. Returns `None` when the node is ready to start.
    pub async fn setup(
        &mut self,
        serial: &mut mpsc::Receiver<String>,
        force: bool,
    ) -> Option<Shutdown> {
        if !force && self.is_configured() {
            return None;
        }

        info!(target: "node", "entering setup mode, waiting for configuration");

        while force || !self.is_configured() {
            let Some(line) = serial.recv().await else {
                info!(target: "node", "serial input closed during setup");
                return Some(Shutdown::InputClosed);
            };

            let result = self.ctx.process(line.as_bytes(), true);
            if let Some(shutdown) = self.settle(result) {
                return Some(shutdown);
            }
        }

        if !is_complete(self.ctx.store.as_ref()) {
            warn!(target: "node", "configured marker set but configuration is incomplete");
        }

        info!(target: "node", "configuration complete");
        None
    }

    /// Load settings, start the transport and announce the node.
    pub fn start(&mut self) -> Result<NodeSettings, NodeError> {
        let settings = NodeSettings::load(self.ctx.store.as_ref());

        match settings.role {
            Role::Controller => info!(
                target: "node",
                "mode: controller, wifi: {:?}, broker: {:?}, username: {:?}",
                settings.wifi_ssid,
                settings.mqtt_host,
                settings.mqtt_username
            ),
            Role::Client => info!(
                target: "node",
                "mode: client, controller: {}",
                settings.controller
            ),
        }

        self.ctx.transport.start(settings.role, settings.channel)?;

        if settings.role == Role::Client {
            match PeerAddress::parse(&settings.controller) {
                Ok(controller) => {
                    self.ctx.transport.pair(&controller);
                }
                Err(e) => warn!(target: "mesh", "unable to pair controller: {}", e),
            }
        }

        self.ctx.reload_peers();
        self.announce();

        Ok(settings)
    }

    fn announce(&mut self) {
        let discovery = json!({
            "SV": env!("CARGO_PKG_VERSION"),
            "Controller": self.ctx.is_controller(),
            "Channel": self.ctx.transport.peers().channel(),
            "Peers": self.ctx.transport.peers().known().len(),
            "Sensors": self.telemetry.is_some(),
        });

        if let Err(e) = self.ctx.publish(discovery.to_string().as_bytes(), DISCOVERY_TOPIC) {
            warn!(target: "node", "unable to publish discovery message: {}", e);
        }
    }

    /// Drive the node until it restarts, sleeps or loses every input.
    pub async fn run(mut self, mut inputs: NodeInputs) -> Shutdown {
        let mut ticker = time::interval(self.telemetry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let telemetry = self.telemetry.is_some() && !self.ctx.is_controller();

        let mut serial_open = true;
        let mut radio_open = true;
        let mut broker_open = inputs.broker.is_some();

        info!(target: "node", "node {} running", self.ctx.identifier());

        loop {
            while let Some(command) = self.ctx.next_queued() {
                let result = self.ctx.process(&command, true);
                if let Some(shutdown) = self.settle(result) {
                    return shutdown;
                }
            }

            if !serial_open && !radio_open && !broker_open {
                info!(target: "node", "all inputs closed");
                return Shutdown::InputClosed;
            }

            let result = tokio::select! {
                line = inputs.serial.recv(), if serial_open => match line {
                    Some(line) => self.ctx.process(line.as_bytes(), true),
                    None => {
                        debug!(target: "node", "serial input closed");
                        serial_open = false;
                        Ok(Disposition::Continue)
                    }
                },
                event = inputs.radio.recv(), if radio_open => match event {
                    Some(event) => self.ctx.handle_radio(event),
                    None => {
                        debug!(target: "node", "radio queue closed");
                        radio_open = false;
                        Ok(Disposition::Continue)
                    }
                },
                message = recv_optional(&mut inputs.broker), if broker_open => match message {
                    Some(message) => self.ctx.process(&message, false),
                    None => {
                        debug!(target: "node", "broker input closed");
                        broker_open = false;
                        Ok(Disposition::Continue)
                    }
                },
                _ = ticker.tick(), if telemetry => {
                    self.publish_telemetry();
                    Ok(Disposition::Continue)
                }
            };

            if let Some(shutdown) = self.settle(result) {
                return shutdown;
            }
        }
    }

    fn publish_telemetry(&mut self) {
        let Some(reading) = self.telemetry.as_mut().and_then(|t| t.sample()) else {
            return;
        };

        if let Err(e) = self.ctx.publish(reading.to_string().as_bytes(), DATA_TOPIC) {
            warn!(target: "node", "unable to publish telemetry: {}", e);
        }
    }

    /// Map a command outcome to a loop decision. Fatal errors restart.
    fn settle(&mut self, result: Result<Disposition, NodeError>) -> Option<Shutdown> {
        match result {
            Ok(Disposition::Continue) => None,
            Ok(Disposition::Restart(reason)) => Some(Shutdown::Restart(reason)),
            Ok(Disposition::Sleep(period)) => Some(Shutdown::Sleep(period)),
            Err(e) if e.is_fatal() => {
                let reason = e.to_string();
                error!(target: "node", "{}", reason);
                if let Err(e) = self.ctx.store.unmount() {
                    warn!(target: "fs", "unmount failed: {}", e);
                }
                self.ctx.system.restart(&reason);
                Some(Shutdown::Restart(reason))
            }
            Err(e) => {
                warn!(target: "node", "command failed: {}", e);
                None
            }
        }
    }
}

async fn recv_optional<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::crypto::SecureChannel;
    use crate::mesh::packet::PacketCodec;
    use crate::platform::{MemoryStore, RadioEvents};
    use crate::testing::{
        FixedTelemetry, RecordingBroker, RecordingRadio, RecordingSystem, ScriptedUpdater,
    };

    const KEY: &str = "node-test-key";

    fn identity() -> PeerAddress {
        PeerAddress::parse("aa:aa:aa:aa:aa:01").unwrap()
    }

    fn context(store: MemoryStore, radio: &RecordingRadio, system: &RecordingSystem) -> NodeContext {
        NodeContext::new(
            identity(),
            Box::new(store),
            Box::new(radio.clone()),
            Box::new(system.clone()),
            Box::new(ScriptedUpdater::failing("no network")),
            OtaSettings::default(),
        )
    }

    fn client_store() -> MemoryStore {
        MemoryStore::new()
            .with(ConfigKey::MeshKey, KEY)
            .with(ConfigKey::MeshController, "cc:cc:cc:cc:cc:01")
            .with(ConfigKey::MeshPeers, "*bb:bb:bb:bb:bb:01,")
            .with(ConfigKey::Configured, "true")
    }

    #[test]
    fn test_parse_channel() {
        assert_eq!(parse_channel(""), 1);
        assert_eq!(parse_channel("6"), 6);
        assert_eq!(parse_channel("0"), 1);
        assert_eq!(parse_channel("-3"), 1);
        assert_eq!(parse_channel("eleven"), 1);
        assert_eq!(parse_channel("999"), 1);
    }

    #[test]
    fn test_settings_role() {
        let settings = NodeSettings::load(&MemoryStore::new());
        assert_eq!(settings.role, Role::Controller);
        assert_eq!(settings.channel, 1);

        let settings = NodeSettings::load(&client_store().with(ConfigKey::MeshChannel, "6"));
        assert_eq!(settings.role, Role::Client);
        assert_eq!(settings.channel, 6);
    }

    #[test]
    fn test_topics() {
        let ctx = context(MemoryStore::new(), &RecordingRadio::new(), &RecordingSystem::new());
        assert_eq!(ctx.command_topic(), "garden/module/AAAAAAAAAA01/cmnd");
        assert_eq!(ctx.tele_topic("data"), "garden/module/AAAAAAAAAA01/tele/data");
        assert_eq!(
            ctx.tele_topic(DISCOVERY_TOPIC),
            "garden/module/discovery/AAAAAAAAAA01"
        );
    }

    #[test]
    fn test_start_client_pairs_controller() {
        let radio = RecordingRadio::new();
        let system = RecordingSystem::new();
        let mut node = Node::new(context(client_store(), &radio, &system));

        let settings = node.start().unwrap();
        assert_eq!(settings.role, Role::Client);

        let registered: Vec<String> = radio
            .registered()
            .iter()
            .map(|(address, _)| address.to_string())
            .collect();
        assert_eq!(registered, vec!["cc:cc:cc:cc:cc:01", "bb:bb:bb:bb:bb:01"]);

        // Discovery goes over the mesh when no broker is connected
        assert_eq!(radio.sent().len(), 2);
    }

    #[test]
    fn test_start_controller_announces_retained() {
        let radio = RecordingRadio::new();
        let system = RecordingSystem::new();
        let broker = RecordingBroker::new();
        let mut ctx = context(MemoryStore::new().with(ConfigKey::MeshKey, KEY), &radio, &system);
        ctx.set_broker(Box::new(broker.clone()));
        let mut node = Node::new(ctx);

        node.start().unwrap();

        let discovery = broker.on_topic("garden/module/discovery/AAAAAAAAAA01");
        assert_eq!(discovery.len(), 1);
        assert!(discovery[0].retain);
        let doc: serde_json::Value = serde_json::from_slice(&discovery[0].payload).unwrap();
        assert_eq!(doc["Controller"], true);
    }

    #[test]
    fn test_start_radio_failure_is_fatal() {
        let radio = RecordingRadio::new();
        radio.fail_init(true);
        let mut node = Node::new(context(client_store(), &radio, &RecordingSystem::new()));

        assert!(node.start().unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_setup_until_configured() {
        let radio = RecordingRadio::new();
        let system = RecordingSystem::new();
        let mut node = Node::new(context(MemoryStore::new(), &radio, &system));
        let (tx, mut rx) = mpsc::channel(4);

        tx.send("not json".to_string()).await.unwrap();
        tx.send(r#"{"MeshKey":"k","MeshPeers":"bb:bb:bb:bb:bb:01"}"#.to_string())
            .await
            .unwrap();

        assert_eq!(node.setup(&mut rx, false).await, None);
        assert!(node.is_configured());
    }

    #[tokio::test]
    async fn test_setup_ends_when_input_closes() {
        let mut node = Node::new(context(
            MemoryStore::new(),
            &RecordingRadio::new(),
            &RecordingSystem::new(),
        ));
        let (tx, mut rx) = mpsc::channel::<String>(1);
        drop(tx);

        assert_eq!(node.setup(&mut rx, false).await, Some(Shutdown::InputClosed));
    }

    #[tokio::test]
    async fn test_run_handles_directed_radio_command() {
        let radio = RecordingRadio::new();
        let system = RecordingSystem::new();
        let mut node = Node::new(context(client_store(), &radio, &system));
        node.start().unwrap();

        let channel = SecureChannel::new(KEY.as_bytes()).unwrap();
        let packet = PacketCodec::new(&channel)
            .frame(br#"dst-AAAAAAAAAA01{"Command":"sleep","Period":0}"#, None)
            .unwrap()
            .next()
            .unwrap();

        let (events, radio_rx) = RadioEvents::channel(8);
        let (_serial_tx, serial_rx) = mpsc::channel(1);
        events.received(PeerAddress::parse("bb:bb:bb:bb:bb:01").unwrap(), packet.as_bytes());

        let shutdown = node
            .run(NodeInputs {
                serial: serial_rx,
                radio: radio_rx,
                broker: None,
            })
            .await;

        assert_eq!(shutdown, Shutdown::Sleep(Duration::from_secs(1)));
        assert_eq!(system.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn test_run_controller_forwards_packets() {
        let radio = RecordingRadio::new();
        let system = RecordingSystem::new();
        let broker = RecordingBroker::new();
        let mut ctx = context(MemoryStore::new().with(ConfigKey::MeshKey, KEY), &radio, &system);
        ctx.set_broker(Box::new(broker.clone()));
        let mut node = Node::new(ctx);
        node.start().unwrap();

        let channel = SecureChannel::new(KEY.as_bytes()).unwrap();
        let packet = PacketCodec::new(&channel)
            .frame(b"{\"Temperature\":21}", Some("garden/module/BBBBBBBBBB01/tele/data"))
            .unwrap()
            .next()
            .unwrap();

        let (events, radio_rx) = RadioEvents::channel(8);
        let (serial_tx, serial_rx) = mpsc::channel(1);
        events.received(PeerAddress::parse("bb:bb:bb:bb:bb:01").unwrap(), packet.as_bytes());
        drop(events);
        drop(serial_tx);

        let shutdown = node
            .run(NodeInputs {
                serial: serial_rx,
                radio: radio_rx,
                broker: None,
            })
            .await;

        assert_eq!(shutdown, Shutdown::InputClosed);
        let forwarded = broker.on_topic("garden/module/AAAAAAAAAA01/tele/packet");
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].payload, packet.as_bytes()[..218].to_vec());
    }

    #[tokio::test]
    async fn test_run_queued_command_first() {
        let radio = RecordingRadio::new();
        let system = RecordingSystem::new();
        let mut node = Node::new(context(client_store(), &radio, &system));
        node.start().unwrap();
        node.context_mut().queue_command(r#"{"Command":"restart"}"#);

        let (_events, radio_rx) = RadioEvents::channel(1);
        let (_serial_tx, serial_rx) = mpsc::channel(1);
        let shutdown = node
            .run(NodeInputs {
                serial: serial_rx,
                radio: radio_rx,
                broker: None,
            })
            .await;

        assert!(matches!(shutdown, Shutdown::Restart(_)));
        assert_eq!(system.restarts().len(), 1);
    }

    #[tokio::test]
    async fn test_run_broker_update_is_refused() {
        let radio = RecordingRadio::new();
        let system = RecordingSystem::new();
        let broker = RecordingBroker::new();
        let mut ctx = context(MemoryStore::new().with(ConfigKey::MeshKey, KEY), &radio, &system);
        ctx.set_broker(Box::new(broker.clone()));
        let mut node = Node::new(ctx);
        node.start().unwrap();

        let (events, radio_rx) = RadioEvents::channel(1);
        let (serial_tx, serial_rx) = mpsc::channel(1);
        let (broker_tx, broker_rx) = mpsc::channel(1);
        broker_tx
            .send(br#"{"Command":"update","U":"u","L":400000,"C":"c"}"#.to_vec())
            .await
            .unwrap();
        drop((events, serial_tx, broker_tx));

        let shutdown = node
            .run(NodeInputs {
                serial: serial_rx,
                radio: radio_rx,
                broker: Some(broker_rx),
            })
            .await;

        assert_eq!(shutdown, Shutdown::InputClosed);
        assert!(system.restarts().is_empty());
        let status = broker.on_topic("garden/module/AAAAAAAAAA01/tele/update");
        assert_eq!(status.len(), 1);
        assert!(status[0].text().contains("\"Success\":false"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_publishes_telemetry() {
        let radio = RecordingRadio::new();
        let system = RecordingSystem::new();
        let node = Node::new(context(client_store(), &radio, &system)).with_telemetry(
            Box::new(FixedTelemetry(json!({"Temperature": 20}))),
            Duration::from_secs(10),
        );
        let mut node = node;
        node.start().unwrap();
        radio.clear_sent();

        let (events, radio_rx) = RadioEvents::channel(1);
        let (serial_tx, serial_rx) = mpsc::channel::<String>(1);

        let handle = tokio::spawn(node.run(NodeInputs {
            serial: serial_rx,
            radio: radio_rx,
            broker: None,
        }));

        time::sleep(Duration::from_secs(15)).await;
        serial_tx.send(r#"{"Command":"restart"}"#.to_string()).await.unwrap();
        let shutdown = handle.await.unwrap();
        drop(events);

        assert!(matches!(shutdown, Shutdown::Restart(_)));
        // One reading at start and one after ten seconds, one packet each to the
        // two paired peers
        assert_eq!(radio.sent().len(), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_restarts() {
        let radio = RecordingRadio::new();
        let system = RecordingSystem::new();
        let store = MemoryStore::new()
            .with(ConfigKey::MeshController, "cc:cc:cc:cc:cc:01")
            .with(ConfigKey::Configured, "true");
        let mut node = Node::new(context(store, &radio, &system));
        node.start().unwrap();

        let (events, radio_rx) = RadioEvents::channel(1);
        let (_serial_tx, serial_rx) = mpsc::channel(1);
        events.received(PeerAddress::parse("bb:bb:bb:bb:bb:01").unwrap(), &[0u8; 250]);

        let shutdown = node
            .run(NodeInputs {
                serial: serial_rx,
                radio: radio_rx,
                broker: None,
            })
            .await;

        assert!(matches!(shutdown, Shutdown::Restart(_)));
        assert_eq!(system.restarts().len(), 1);
    }
}
