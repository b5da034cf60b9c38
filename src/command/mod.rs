//! Command Router
//!
//! Every command, whatever its source, enters through
//! [`CommandRouter::process`]:
//!
//! 1. empty input is ignored
//! 2. encrypted frames are decrypted; a frame that fails to authenticate is
//!    dropped without any response
//! 3. a leading destination marker is removed
//! 4. the rest is parsed as a [`CommandDocument`]
//! 5. a `Command` field is dispatched
//! 6. configuration fields are persisted, each on its own
//! 7. the configured flag is recomputed if anything was written
//!
//! Serial input is trusted. Radio and broker input is not, unless it
//! decrypts.

pub mod document;
pub mod envelope;

pub use document::{decode_payload, fields, CommandDocument, ProtocolError};
pub use envelope::{Envelope, Trust};

use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::NodeError;
use crate::mesh::error::{ConfigError, CryptoError, TransportError};
use crate::mesh::peers::PeerAddress;
use crate::mesh::transport::{broadcast_marker, contains_marker};
use crate::node::NodeContext;
use crate::platform::{ConfigKey, ConfigStore, FirmwareUpdate};

/// Radio channels a mesh may be configured on
pub const CHANNEL_RANGE: std::ops::RangeInclusive<i64> = 1..=14;

/// Tele topic for firmware update status
pub const UPDATE_TOPIC: &str = "update";

/// Tele topic for ping replies
pub const PING_TOPIC: &str = "ping";

/// Tele topic for the stored peer list
pub const PEERS_TOPIC: &str = "peers";

/// What the caller should do after a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Keep running
    Continue,
    /// A restart was requested from the platform
    Restart(String),
    /// The node entered deep sleep
    Sleep(Duration),
}

/// Dispatches commands against a node context.
pub struct CommandRouter<'a> {
    ctx: &'a mut NodeContext,
}

impl<'a> CommandRouter<'a> {
    pub fn new(ctx: &'a mut NodeContext) -> Self {
        Self { ctx }
    }

    /// Process one raw command.
    ///
    /// Only fatal conditions are returned as errors. Everything else is
    /// logged locally and reported as [`Disposition::Continue`].
    pub fn process(&mut self, raw: &[u8], trusted: bool) -> Result<Disposition, NodeError> {
        let raw = trim_line(raw);
        if raw.is_empty() {
            return Ok(Disposition::Continue);
        }

        let envelope = match Envelope::open(raw, trusted, &mut self.ctx.keys, self.ctx.store.as_ref()) {
            Ok(envelope) => envelope,
            Err(CryptoError::DecryptionFailed) => {
                debug!(target: "crypto", "dropping command that failed to decrypt");
                return Ok(Disposition::Continue);
            }
            Err(e) => {
                error!(target: "crypto", "unable to decrypt command: {}", e);
                return Err(e.into());
            }
        };

        debug!(target: "cmnd", "deserializing {} byte command", envelope.body.len());
        let doc = match CommandDocument::parse(&envelope.body) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(target: "cmnd", "deserialization failed: {}", e);
                return Ok(Disposition::Continue);
            }
        };

        if let Some(command) = doc.command() {
            match self.dispatch(&command, &doc, envelope.trust, trusted)? {
                Some(Disposition::Continue) => {}
                Some(other) => return Ok(other),
                None => return Ok(Disposition::Continue),
            }
        }

        if self.apply_settings(&doc) {
            self.update_configured_flag();
        }

        Ok(Disposition::Continue)
    }

    /// Run a `Command`. `None` aborts the rest of the document.
    fn dispatch(
        &mut self,
        command: &str,
        doc: &CommandDocument,
        trust: Trust,
        trusted: bool,
    ) -> Result<Option<Disposition>, NodeError> {
        debug!(target: "cmnd", "handling command {}", command);

        let disposition = match command {
            "scan" => {
                self.ctx.system.start_network_scan();
                Disposition::Continue
            }
            "restart" => {
                if let Err(e) = self.ctx.store.unmount() {
                    warn!(target: "fs", "unmount failed: {}", e);
                }
                self.ctx.system.restart("restart requested");
                Disposition::Restart("restart requested".to_string())
            }
            "reset" => {
                info!(target: "cmnd", "factory reset");
                if let Err(e) = self.ctx.store.format() {
                    error!(target: "fs", "format failed: {}", e);
                }
                self.ctx.system.restart("factory reset");
                Disposition::Restart("factory reset".to_string())
            }
            "publish" => return self.publish(doc, trusted),
            "listpeers" => {
                let peers = self.ctx.store.read_string(ConfigKey::MeshPeers);
                self.report_best_effort(peers.as_bytes(), PEERS_TOPIC);
                Disposition::Continue
            }
            "ping" => {
                self.report_best_effort(b"pong", PING_TOPIC);
                Disposition::Continue
            }
            "sleep" => self.sleep(doc),
            "update" => self.update(doc, trust)?,
            other => {
                warn!(target: "cmnd", "unknown command {:?}", other);
                Disposition::Continue
            }
        };

        Ok(Some(disposition))
    }

    fn publish(
        &mut self,
        doc: &CommandDocument,
        trusted: bool,
    ) -> Result<Option<Disposition>, NodeError> {
        let payload = doc.string_or_empty(fields::PAYLOAD);
        if payload.is_empty() {
            warn!(target: "cmnd", "{}", ProtocolError::MissingField(fields::PAYLOAD));
            return Ok(None);
        }

        let payload = match decode_payload(&payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(target: "cmnd", "{}", e);
                return Ok(None);
            }
        };

        match self.ctx.publish_mesh(&payload, None) {
            Ok(total) => debug!(target: "cmnd", "published payload in {} packets", total),
            Err(NodeError::Transport(e @ TransportError::MessageTooLarge(..))) => {
                warn!(target: "cmnd", "{}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        // The controller never receives its own relay, so broadcast commands
        // are also run here.
        if let Some(rest) = after_marker(&payload, &broadcast_marker()) {
            debug!(target: "cmnd", "running broadcast command locally");
            return self.process(rest, trusted).map(Some);
        }

        Ok(Some(Disposition::Continue))
    }

    fn sleep(&mut self, doc: &CommandDocument) -> Disposition {
        if self.ctx.is_controller() && !doc.flag(fields::INCLUDE_CONTROLLER) {
            info!(target: "cmnd", "not sleeping, this node is the controller");
            return Disposition::Continue;
        }

        let seconds = doc.integer(fields::PERIOD).unwrap_or(0).max(1) as u64;
        let period = Duration::from_secs(seconds);

        info!(target: "cmnd", "sleeping for {}s", seconds);
        self.ctx.system.deep_sleep(period);
        Disposition::Sleep(period)
    }

    fn update(&mut self, doc: &CommandDocument, trust: Trust) -> Result<Disposition, NodeError> {
        if !trust.is_secure() {
            warn!(target: "ota", "refusing update from an insecure source");
            self.report_status(false, "updates must be sent encrypted");
            return Ok(Disposition::Continue);
        }

        let update = match self.firmware_update(doc) {
            Ok(update) => update,
            Err(message) => {
                warn!(target: "ota", "{}", message);
                self.report_status(false, &message);
                return Ok(Disposition::Continue);
            }
        };

        info!(target: "ota", "starting update from {}", update.url);
        self.report_status(true, "attempting update");

        let message = match self.ctx.updater.install(&update) {
            Ok(()) => "update finished without restarting".to_string(),
            Err(e) => e.to_string(),
        };

        error!(target: "ota", "update failed: {}", message);
        self.report_status(false, &message);
        Err(NodeError::Fatal(format!("firmware update failed: {}", message)))
    }

    fn firmware_update(&self, doc: &CommandDocument) -> Result<FirmwareUpdate, String> {
        let required = |name: &'static str| {
            doc.string(name)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| ProtocolError::MissingField(name).to_string())
        };

        let url = required(fields::UPDATE_URL)?;
        let checksum = required(fields::UPDATE_CHECKSUM)?;
        required(fields::UPDATE_LENGTH)?;

        let length = doc
            .integer(fields::UPDATE_LENGTH)
            .filter(|length| *length > 0)
            .ok_or_else(|| "the L property must be a positive integer".to_string())?
            as u64;

        let minimum = self.ctx.ota.min_firmware_size;
        if length <= minimum {
            return Err(format!(
                "firmware length {} is not above the minimum of {} bytes",
                length, minimum
            ));
        }

        Ok(FirmwareUpdate {
            ssid: doc.string(fields::UPDATE_SSID).filter(|s| !s.is_empty()),
            password: doc.string(fields::UPDATE_PASSWORD),
            url,
            length,
            checksum,
            connect_timeout: self.ctx.ota.connect_timeout,
        })
    }

    fn report_status(&mut self, success: bool, message: &str) {
        let status = json!({ "Success": success, "Message": message });
        self.report_best_effort(status.to_string().as_bytes(), UPDATE_TOPIC);
    }

    fn report_best_effort(&mut self, data: &[u8], tele_topic: &str) {
        if let Err(e) = self.ctx.publish(data, tele_topic) {
            warn!(target: "cmnd", "unable to publish to {}: {}", tele_topic, e);
        }
    }

    /// Persist configuration fields. Returns true if anything was written.
    fn apply_settings(&mut self, doc: &CommandDocument) -> bool {
        let mut changed = false;

        if doc.contains(fields::WIFI_SSID) {
            changed |= self.persist(ConfigKey::WifiSsid, &doc.string_or_empty(fields::WIFI_SSID));
            changed |= self.persist(
                ConfigKey::WifiPassword,
                &doc.string_or_empty(fields::WIFI_PASSWORD),
            );
            debug!(target: "cmnd", "updated wifi settings");
        }

        if doc.contains(fields::MQTT_HOST) {
            changed |= self.persist(ConfigKey::MqttHost, &doc.string_or_empty(fields::MQTT_HOST));
            debug!(target: "cmnd", "updated mqtt settings");

            if doc.contains(fields::MQTT_USERNAME) {
                changed |= self.persist(
                    ConfigKey::MqttUsername,
                    &doc.string_or_empty(fields::MQTT_USERNAME),
                );
                changed |= self.persist(
                    ConfigKey::MqttPassword,
                    &doc.string_or_empty(fields::MQTT_PASSWORD),
                );
                debug!(target: "cmnd", "mqtt is authenticated");
            }
        }

        if doc.contains(fields::MESH_CONTROLLER) {
            changed |= self.set_controller(&doc.string_or_empty(fields::MESH_CONTROLLER));
        }

        if doc.contains(fields::MESH_CHANNEL) {
            changed |= self.set_channel(doc);
        }

        if doc.contains(fields::MESH_KEY) {
            let key = doc.string_or_empty(fields::MESH_KEY);
            if key.is_empty() {
                warn!(target: "crypto", "ignoring empty mesh key");
            } else {
                changed |= self.persist(ConfigKey::MeshKey, &key);
            }
        }

        if doc.contains(fields::MESH_PEERS) {
            changed |= self.set_peers(&doc.string_or_empty(fields::MESH_PEERS));
        }

        changed
    }

    /// An empty address clears the controller, making this node the
    /// controller after the next restart.
    fn set_controller(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            debug!(target: "mesh", "clearing mesh controller");
            return self.remove(ConfigKey::MeshController);
        }

        match PeerAddress::parse(text) {
            Ok(address) => self.persist(ConfigKey::MeshController, &address.to_string()),
            Err(e) => {
                warn!(target: "mesh", "not storing mesh controller: {}", e);
                false
            }
        }
    }

    fn set_channel(&mut self, doc: &CommandDocument) -> bool {
        match doc.integer(fields::MESH_CHANNEL) {
            Some(channel) if CHANNEL_RANGE.contains(&channel) => {
                self.persist(ConfigKey::MeshChannel, &channel.to_string())
            }
            _ => {
                let err = ConfigError::InvalidChannel(doc.string_or_empty(fields::MESH_CHANNEL));
                warn!(target: "mesh", "not storing mesh channel: {}", err);
                false
            }
        }
    }

    /// Peers are appended to the stored list; an empty list clears it.
    fn set_peers(&mut self, peers: &str) -> bool {
        let current = if peers.is_empty() {
            debug!(target: "mesh", "blanking known peers");
            String::new()
        } else {
            debug!(target: "mesh", "appending to peer list");
            let mut current = self.ctx.store.read_string(ConfigKey::MeshPeers);
            current.push_str(peers);
            if !current.ends_with(',') {
                current.push(',');
            }
            current
        };

        let changed = self.persist(ConfigKey::MeshPeers, &current);
        self.ctx.reload_peers();
        changed
    }

    fn persist(&mut self, key: ConfigKey, value: &str) -> bool {
        match self.ctx.store.write(key, value.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "fs", "unable to write {}: {}", key.name(), e);
                false
            }
        }
    }

    fn remove(&mut self, key: ConfigKey) -> bool {
        match self.ctx.store.delete(key) {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "fs", "unable to delete {}: {}", key.name(), e);
                false
            }
        }
    }

    fn update_configured_flag(&mut self) {
        let configured = is_complete(self.ctx.store.as_ref());

        let result = if configured {
            debug!(target: "cmnd", "configuration complete, setting flag");
            self.ctx.store.write(ConfigKey::Configured, b"true")
        } else {
            debug!(target: "cmnd", "not configured");
            self.ctx.store.delete(ConfigKey::Configured)
        };

        if let Err(e) = result {
            warn!(target: "fs", "unable to update configured flag: {}", e);
        }
    }
}

/// True if the store holds enough to run unattended: Wi-Fi and broker
/// settings, or a mesh key together with a controller or peers.
pub fn is_complete(store: &dyn ConfigStore) -> bool {
    let uplink = store.has_value(ConfigKey::WifiSsid) && store.has_value(ConfigKey::MqttHost);
    let mesh = store.has_value(ConfigKey::MeshKey)
        && (store.has_value(ConfigKey::MeshController) || store.has_value(ConfigKey::MeshPeers));
    uplink || mesh
}

fn trim_line(raw: &[u8]) -> &[u8] {
    let end = raw
        .iter()
        .rposition(|b| !matches!(b, b'\r' | b'\n'))
        .map(|i| i + 1)
        .unwrap_or(0);
    &raw[..end]
}

/// Bytes following the first case-insensitive occurrence of `marker`
fn after_marker<'p>(payload: &'p [u8], marker: &str) -> Option<&'p [u8]> {
    if !contains_marker(payload, marker) {
        return None;
    }

    payload
        .windows(marker.len())
        .position(|window| window.eq_ignore_ascii_case(marker.as_bytes()))
        .map(|start| &payload[start + marker.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::crypto::SecureChannel;
    use crate::mesh::packet::PacketCodec;
    use crate::mesh::transport::Role;
    use crate::node::{NodeContext, OtaSettings};
    use crate::platform::MemoryStore;
    use crate::testing::{RecordingBroker, RecordingRadio, RecordingSystem, ScriptedUpdater};

    const KEY: &str = "router-test-key";
    const IDENTITY: &str = "aa:aa:aa:aa:aa:01";

    struct Harness {
        ctx: NodeContext,
        radio: RecordingRadio,
        broker: RecordingBroker,
        system: RecordingSystem,
        updater: ScriptedUpdater,
    }

    impl Harness {
        fn new(role: Role, store: MemoryStore) -> Self {
            let radio = RecordingRadio::new();
            let broker = RecordingBroker::new();
            let system = RecordingSystem::new();
            let updater = ScriptedUpdater::failing("checksum mismatch");

            let mut ctx = NodeContext::new(
                PeerAddress::parse(IDENTITY).unwrap(),
                Box::new(store),
                Box::new(radio.clone()),
                Box::new(system.clone()),
                Box::new(updater.clone()),
                OtaSettings::default(),
            );
            ctx.transport.start(role, 1).unwrap();
            if role == Role::Controller {
                ctx.set_broker(Box::new(broker.clone()));
            }

            Self {
                ctx,
                radio,
                broker,
                system,
                updater,
            }
        }

        fn client() -> Self {
            Self::new(Role::Client, MemoryStore::new().with(ConfigKey::MeshKey, KEY))
        }

        fn controller() -> Self {
            Self::new(Role::Controller, MemoryStore::new().with(ConfigKey::MeshKey, KEY))
        }

        fn process(&mut self, raw: &str, trusted: bool) -> Result<Disposition, NodeError> {
            CommandRouter::new(&mut self.ctx).process(raw.as_bytes(), trusted)
        }

        fn stored(&self, key: ConfigKey) -> String {
            self.ctx.store.read_string(key)
        }

        fn statuses(&self) -> Vec<serde_json::Value> {
            self.broker
                .on_topic("garden/module/AAAAAAAAAA01/tele/update")
                .iter()
                .map(|p| serde_json::from_slice(&p.payload).unwrap())
                .collect()
        }
    }

    fn encrypted(command: &str) -> Vec<u8> {
        SecureChannel::new(KEY.as_bytes())
            .unwrap()
            .encrypt(command.as_bytes())
            .unwrap()
            .to_frame()
    }

    #[test]
    fn test_empty_input_is_ignored() {
        let mut h = Harness::client();
        assert_eq!(h.process("", true).unwrap(), Disposition::Continue);
        assert_eq!(h.process("\r\n", true).unwrap(), Disposition::Continue);
        assert!(!h.ctx.keys.is_loaded());
    }

    #[test]
    fn test_malformed_document_has_no_effect() {
        let mut h = Harness::client();
        assert_eq!(h.process("{\"Command\":", false).unwrap(), Disposition::Continue);
        assert!(h.broker.published().is_empty());
        assert!(h.radio.sent().is_empty());
    }

    #[test]
    fn test_scan() {
        let mut h = Harness::client();
        h.process(r#"{"Command":"SCAN"}"#, false).unwrap();
        assert_eq!(h.system.scans(), 1);
    }

    #[test]
    fn test_restart() {
        let mut h = Harness::client();
        let disposition = h.process(r#"{"Command":"restart","WifiSSID":"x"}"#, true).unwrap();

        assert!(matches!(disposition, Disposition::Restart(_)));
        assert_eq!(h.system.restarts().len(), 1);
        assert!(!h.ctx.store.exists(ConfigKey::WifiSsid));
    }

    #[test]
    fn test_reset_formats_store() {
        let mut h = Harness::client();
        let disposition = h.process(r#"{"Command":"reset"}"#, true).unwrap();

        assert!(matches!(disposition, Disposition::Restart(_)));
        assert!(!h.ctx.store.exists(ConfigKey::MeshKey));
        assert_eq!(h.system.restarts(), vec!["factory reset".to_string()]);
    }

    #[test]
    fn test_sleep_period_is_clamped() {
        let mut h = Harness::client();
        let disposition = h.process(r#"{"Command":"sleep","Period":0}"#, false).unwrap();
        assert_eq!(disposition, Disposition::Sleep(Duration::from_secs(1)));

        let mut h = Harness::client();
        h.process(r#"{"Command":"sleep","Period":-30}"#, false).unwrap();
        assert_eq!(h.system.sleeps(), vec![Duration::from_secs(1)]);

        let mut h = Harness::client();
        h.process(r#"{"Command":"sleep","Period":"45"}"#, false).unwrap();
        assert_eq!(h.system.sleeps(), vec![Duration::from_secs(45)]);
    }

    #[test]
    fn test_controller_does_not_sleep_by_default() {
        let mut h = Harness::controller();
        let disposition = h.process(r#"{"Command":"sleep"}"#, false).unwrap();

        assert_eq!(disposition, Disposition::Continue);
        assert!(h.system.sleeps().is_empty());
    }

    #[test]
    fn test_controller_sleeps_when_included() {
        let mut h = Harness::controller();
        h.process(r#"{"Command":"sleep","Period":5,"IncludeController":true}"#, false)
            .unwrap();
        assert_eq!(h.system.sleeps(), vec![Duration::from_secs(5)]);
    }

    #[test]
    fn test_ping_and_listpeers() {
        let mut h = Harness::controller();
        h.ctx.store.write(ConfigKey::MeshPeers, b"aa:bb:cc:dd:ee:ff,").unwrap();

        h.process(r#"{"Command":"Ping"}"#, false).unwrap();
        h.process(r#"{"Command":"ListPeers"}"#, false).unwrap();

        let ping = h.broker.on_topic("garden/module/AAAAAAAAAA01/tele/ping");
        assert_eq!(ping[0].text(), "pong");
        let peers = h.broker.on_topic("garden/module/AAAAAAAAAA01/tele/peers");
        assert_eq!(peers[0].text(), "aa:bb:cc:dd:ee:ff,");
    }

    #[test]
    fn test_publish_requires_payload() {
        let mut h = Harness::client();
        h.ctx.transport.pair(&PeerAddress::parse("bb:bb:bb:bb:bb:01").unwrap());

        h.process(r#"{"Command":"publish","Payload":"","MeshChannel":3}"#, true)
            .unwrap();

        assert!(h.radio.sent().is_empty());
        assert!(!h.ctx.store.exists(ConfigKey::MeshChannel));
    }

    #[test]
    fn test_publish_hex_payload() {
        let mut h = Harness::client();
        h.ctx.transport.pair(&PeerAddress::parse("bb:bb:bb:bb:bb:01").unwrap());

        h.process(r#"{"Command":"publish","Payload":"h68656c6c6f"}"#, false)
            .unwrap();

        let sent = h.radio.sent();
        assert_eq!(sent.len(), 1);
        let channel = SecureChannel::new(KEY.as_bytes()).unwrap();
        let packet = PacketCodec::new(&channel).unframe(&sent[0].1).unwrap();
        assert_eq!(packet.trimmed_payload(), b"hello");
    }

    #[test]
    fn test_publish_600_bytes_is_three_fragments() {
        let mut h = Harness::client();
        h.ctx.transport.pair(&PeerAddress::parse("bb:bb:bb:bb:bb:01").unwrap());

        let command = format!(r#"{{"Command":"publish","Payload":"{}"}}"#, "x".repeat(600));
        h.process(&command, false).unwrap();

        let headers: Vec<(u8, u8)> = h.radio.sent().iter().map(|(_, p)| (p[4], p[5])).collect();
        assert_eq!(headers, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn test_publish_broadcast_runs_locally() {
        let mut h = Harness::controller();
        h.ctx.transport.pair(&PeerAddress::parse("bb:bb:bb:bb:bb:01").unwrap());

        let inner = r#"dst-FFFFFFFFFFFF{"Command":"scan"}"#;
        let command = format!(
            r#"{{"Command":"publish","Payload":"h{}"}}"#,
            hex::encode(inner)
        );
        h.process(&command, false).unwrap();

        assert_eq!(h.radio.sent().len(), 1);
        assert_eq!(h.system.scans(), 1);
    }

    #[test]
    fn test_update_refused_when_insecure() {
        let mut h = Harness::controller();
        let disposition = h.process(r#"{"Command":"update"}"#, false).unwrap();

        assert_eq!(disposition, Disposition::Continue);
        assert!(h.updater.attempts().is_empty());
        let statuses = h.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0]["Success"], false);
    }

    #[test]
    fn test_update_requires_fields() {
        let mut h = Harness::controller();
        h.process(r#"{"Command":"update","U":"http://fw/bin","C":"abc"}"#, true)
            .unwrap();

        assert!(h.updater.attempts().is_empty());
        assert_eq!(h.statuses()[0]["Message"], "the L property is required");
    }

    #[test]
    fn test_update_rejects_small_image() {
        let mut h = Harness::controller();
        h.process(r#"{"Command":"update","U":"http://fw/bin","L":1000,"C":"abc"}"#, true)
            .unwrap();
        assert!(h.updater.attempts().is_empty());
        assert_eq!(h.statuses()[0]["Success"], false);
    }

    #[test]
    fn test_update_failure_is_fatal() {
        let mut h = Harness::controller();
        let err = h
            .process(
                r#"{"Command":"update","U":"http://fw/bin","L":400000,"C":"abc","S":"ota","P":"pw"}"#,
                true,
            )
            .unwrap_err();

        assert!(err.is_fatal());
        let attempts = h.updater.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].length, 400000);
        assert_eq!(attempts[0].ssid.as_deref(), Some("ota"));

        let statuses = h.statuses();
        assert_eq!(statuses[0]["Success"], true);
        assert_eq!(statuses[1]["Success"], false);
        assert_eq!(statuses[1]["Message"], "checksum mismatch");
    }

    #[test]
    fn test_encrypted_update_is_trusted() {
        let mut h = Harness::controller();
        let frame = encrypted(r#"{"Command":"update","U":"u","L":400000,"C":"c"}"#);

        let result = CommandRouter::new(&mut h.ctx).process(&frame, false);
        assert!(result.is_err());
        assert_eq!(h.updater.attempts().len(), 1);
    }

    #[test]
    fn test_tampered_encrypted_command_is_silent() {
        let mut h = Harness::controller();
        let mut frame = encrypted(r#"{"Command":"ping"}"#);
        frame[5] ^= 0xff;

        let disposition = CommandRouter::new(&mut h.ctx).process(&frame, false).unwrap();
        assert_eq!(disposition, Disposition::Continue);
        assert!(h.broker.published().is_empty());
    }

    #[test]
    fn test_encrypted_command_without_key_is_fatal() {
        let mut h = Harness::new(Role::Client, MemoryStore::new());
        let frame = encrypted(r#"{"Command":"ping"}"#);

        let err = CommandRouter::new(&mut h.ctx).process(&frame, false).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_wifi_and_mqtt_settings() {
        let mut h = Harness::new(Role::Client, MemoryStore::new());
        h.process(
            r#"{"WifiSSID":"garden","WifiPassword":"pw","MQTTHost":"broker.local"}"#,
            true,
        )
        .unwrap();

        assert_eq!(h.stored(ConfigKey::WifiSsid), "garden");
        assert_eq!(h.stored(ConfigKey::WifiPassword), "pw");
        assert_eq!(h.stored(ConfigKey::MqttHost), "broker.local");
        assert!(!h.ctx.store.exists(ConfigKey::MqttUsername));
        assert!(h.ctx.store.exists(ConfigKey::Configured));

        h.process(r#"{"MQTTHost":"b","MQTTUsername":"u","MQTTPassword":"p"}"#, true)
            .unwrap();
        assert_eq!(h.stored(ConfigKey::MqttUsername), "u");
        assert_eq!(h.stored(ConfigKey::MqttPassword), "p");
    }

    #[test]
    fn test_invalid_controller_is_not_stored() {
        let mut h = Harness::new(Role::Client, MemoryStore::new());
        h.process(r#"{"MeshController":"ff:ff:ff:ff:ff:ff","MeshKey":"k"}"#, true)
            .unwrap();

        assert!(!h.ctx.store.exists(ConfigKey::MeshController));
        assert_eq!(h.stored(ConfigKey::MeshKey), "k");
        assert!(!h.ctx.store.exists(ConfigKey::Configured));

        h.process(r#"{"MeshController":"AA:BB:CC:DD:EE:01"}"#, true).unwrap();
        assert_eq!(h.stored(ConfigKey::MeshController), "aa:bb:cc:dd:ee:01");
        assert!(h.ctx.store.exists(ConfigKey::Configured));
    }

    #[test]
    fn test_channel_validation() {
        let mut h = Harness::client();
        h.process(r#"{"MeshChannel":0}"#, true).unwrap();
        h.process(r#"{"MeshChannel":"15"}"#, true).unwrap();
        assert!(!h.ctx.store.exists(ConfigKey::MeshChannel));

        h.process(r#"{"MeshChannel":"11"}"#, true).unwrap();
        assert_eq!(h.stored(ConfigKey::MeshChannel), "11");
    }

    #[test]
    fn test_peers_append_then_clear() {
        let mut h = Harness::client();

        h.process(r#"{"MeshPeers":"aa:bb:cc:dd:ee:ff"}"#, true).unwrap();
        assert_eq!(h.stored(ConfigKey::MeshPeers), "aa:bb:cc:dd:ee:ff,");
        assert!(h.ctx.transport.peers().is_known("aa:bb:cc:dd:ee:ff"));
        assert!(h.ctx.store.exists(ConfigKey::Configured));

        h.process(r#"{"MeshPeers":"*11:22:33:44:55:66,"}"#, true).unwrap();
        assert_eq!(
            h.stored(ConfigKey::MeshPeers),
            "aa:bb:cc:dd:ee:ff,*11:22:33:44:55:66,"
        );
        assert_eq!(h.ctx.transport.peers().paired().len(), 1);

        h.process(r#"{"MeshPeers":""}"#, true).unwrap();
        assert_eq!(h.stored(ConfigKey::MeshPeers), "");
        assert!(h.ctx.transport.peers().known().is_empty());
        assert!(!h.ctx.store.exists(ConfigKey::Configured));
    }

    #[test]
    fn test_fields_are_independent() {
        let mut h = Harness::client();
        h.process(r#"{"MeshChannel":99,"MeshController":"nope","MQTTHost":"h"}"#, true)
            .unwrap();

        assert!(!h.ctx.store.exists(ConfigKey::MeshChannel));
        assert!(!h.ctx.store.exists(ConfigKey::MeshController));
        assert_eq!(h.stored(ConfigKey::MqttHost), "h");
    }

    #[test]
    fn test_is_complete() {
        assert!(!is_complete(&MemoryStore::new()));
        assert!(is_complete(
            &MemoryStore::new()
                .with(ConfigKey::WifiSsid, "s")
                .with(ConfigKey::MqttHost, "h")
        ));
        assert!(!is_complete(&MemoryStore::new().with(ConfigKey::WifiSsid, "s")));
        assert!(!is_complete(
            &MemoryStore::new().with(ConfigKey::MeshController, "aa:bb:cc:dd:ee:ff")
        ));
        assert!(is_complete(
            &MemoryStore::new()
                .with(ConfigKey::MeshKey, "k")
                .with(ConfigKey::MeshPeers, "aa:bb:cc:dd:ee:ff,")
        ));
    }

    #[test]
    fn test_after_marker() {
        assert_eq!(
            after_marker(b"xxdst-ffffffffffff{}", "dst-FFFFFFFFFFFF"),
            Some(&b"{}"[..])
        );
        assert_eq!(after_marker(b"{}", "dst-FFFFFFFFFFFF"), None);
    }
}
