//! Mesh transport
//!
//! Sends and receives [`WirePacket`]s over the radio and decides what
//! happens to each authenticated packet:
//!
//! - the **controller** forwards it upstream to the broker and never relays
//!   over radio
//! - a **client** relays anything not addressed to it to every paired peer
//!   except the one it came from, and hands commands addressed to it (or to
//!   everyone) to the command router
//!
//! Loops are avoided only by excluding the sender. A copy arriving from a
//! second neighbour is relayed again.

use std::fmt;
use tracing::{debug, error, info, trace, warn};

use super::crypto::{SecureChannel, MAX_SEALED_PLAINTEXT};
use super::error::TransportError;
use super::packet::{PacketCodec, PACKET_SIZE};
use super::peers::{PeerAddress, PeerRegistry};
use crate::platform::Radio;

/// Prefix of a destination marker, followed by a 12 hex digit identifier
pub const DESTINATION_PREFIX: &str = "dst-";

/// Identifier addressing every node
pub const BROADCAST_IDENTIFIER: &str = "FFFFFFFFFFFF";

/// Length of a full `dst-XXXXXXXXXXXX` marker
pub const DESTINATION_MARKER_LEN: usize = DESTINATION_PREFIX.len() + 12;

/// Largest command that still fits one packet once sealed and addressed
pub const MAX_ADDRESSED_COMMAND: usize = MAX_SEALED_PLAINTEXT - DESTINATION_MARKER_LEN;

/// Tele topic the controller forwards mesh packets on
pub const PACKET_TOPIC: &str = "packet";

/// Marker addressing one node
pub fn destination_marker(identifier: &str) -> String {
    format!("{}{}", DESTINATION_PREFIX, identifier.to_ascii_uppercase())
}

/// Marker addressing every node
pub fn broadcast_marker() -> String {
    destination_marker(BROADCAST_IDENTIFIER)
}

/// Remove a leading `dst-XXXXXXXXXXXX` marker, if any.
pub fn strip_destination(text: &[u8]) -> &[u8] {
    if text.len() < DESTINATION_MARKER_LEN {
        return text;
    }

    let (marker, rest) = text.split_at(DESTINATION_MARKER_LEN);
    let (prefix, identifier) = marker.split_at(DESTINATION_PREFIX.len());

    if prefix.eq_ignore_ascii_case(DESTINATION_PREFIX.as_bytes())
        && identifier.iter().all(|b| b.is_ascii_hexdigit())
    {
        rest
    } else {
        text
    }
}

/// Case-insensitive substring search
pub fn contains_marker(haystack: &[u8], marker: &str) -> bool {
    let marker = marker.as_bytes();
    if marker.is_empty() {
        return true;
    }

    haystack
        .windows(marker.len())
        .any(|window| window.eq_ignore_ascii_case(marker))
}

/// Node role on the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Holds the broker uplink
    Controller,
    /// Relays and originates traffic
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Controller => f.write_str("controller"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Lifecycle of the transport. There is no way back to `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Uninitialized,
    Active { role: Role, channel: u8 },
}

/// Packet counters since boot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeshStatistics {
    /// Packets submitted to the radio
    pub sent: u64,
    /// Buffers delivered by the radio
    pub received: u64,
    pub dropped_length: u64,
    pub dropped_auth: u64,
    /// Packets whose MAC verified
    pub accepted: u64,
}

/// Outcome of an accepted packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Controller: header and payload to forward upstream
    Uplink(Vec<u8>),

    /// Client: how many peers the packet was relayed to, and the command
    /// text if it was addressed to this node
    Delivered {
        relayed: usize,
        command: Option<Vec<u8>>,
    },
}

/// Radio side of the mesh.
pub struct MeshTransport {
    identity: PeerAddress,
    state: TransportState,
    radio: Box<dyn Radio>,
    peers: PeerRegistry,
    stats: MeshStatistics,
}

impl fmt::Debug for MeshTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshTransport")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("peers", &self.peers)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl MeshTransport {
    pub fn new(identity: PeerAddress, radio: Box<dyn Radio>) -> Self {
        Self {
            identity,
            state: TransportState::Uninitialized,
            radio,
            peers: PeerRegistry::new(1),
            stats: MeshStatistics::default(),
        }
    }

    /// Bring the radio up. Only allowed once per boot.
    pub fn start(&mut self, role: Role, channel: u8) -> Result<(), TransportError> {
        if let TransportState::Active { .. } = self.state {
            return Err(TransportError::AlreadyActive);
        }

        debug!(target: "mesh", "starting mesh on channel {} as {}", channel, role);

        self.radio.init(role, channel).map_err(|e| {
            error!(target: "mesh", "unable to start mesh: {}", e);
            TransportError::Radio(e)
        })?;

        self.peers.set_channel(channel);
        self.state = TransportState::Active { role, channel };

        info!(target: "mesh", "mesh started");
        Ok(())
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        match self.state {
            TransportState::Active { role, .. } => Some(role),
            TransportState::Uninitialized => None,
        }
    }

    pub fn is_controller(&self) -> bool {
        self.role() == Some(Role::Controller)
    }

    pub fn identity(&self) -> &PeerAddress {
        &self.identity
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn stats(&self) -> &MeshStatistics {
        &self.stats
    }

    /// Register an address with the radio.
    pub fn pair(&mut self, address: &PeerAddress) -> bool {
        self.peers.pair(address, self.radio.as_mut())
    }

    /// Rebuild peer membership from stored configuration.
    pub fn reload_peers(&mut self, controller: &str, peers: &str) -> usize {
        self.peers.load_known(controller, peers, self.radio.as_mut())
    }

    /// Send one packet to every paired peer except `exclude`.
    ///
    /// Fire and forget. Returns the number of peers the packet was submitted to.
    pub fn broadcast(
        &mut self,
        packet: &[u8; PACKET_SIZE],
        exclude: Option<&PeerAddress>,
    ) -> usize {
        match exclude {
            Some(address) => debug!(target: "mesh", "broadcasting to all peers except {}", address),
            None => debug!(target: "mesh", "broadcasting to all peers"),
        }

        let mut submitted = 0;
        for address in self.peers.paired() {
            if Some(address) == exclude {
                continue;
            }

            trace!(target: "mesh", "sending packet to {}", address);
            match self.radio.send(address, packet) {
                Ok(()) => submitted += 1,
                Err(e) => warn!(target: "mesh", "send to {} failed: {}", address, e),
            }
        }

        self.stats.sent += submitted as u64;
        submitted
    }

    /// Frame a message and broadcast every fragment in order.
    ///
    /// Returns the number of fragments.
    pub fn publish(
        &mut self,
        channel: &SecureChannel,
        payload: &[u8],
        topic: Option<&str>,
    ) -> Result<u8, TransportError> {
        if self.state == TransportState::Uninitialized {
            return Err(TransportError::NotActive);
        }

        let fragments = PacketCodec::new(channel).frame(payload, topic)?;
        let total = fragments.total();

        debug!(
            target: "mesh",
            "sending len:{}, cor:{:08x}, tot:{}",
            payload.len(),
            fragments.correlation(),
            total
        );

        for packet in fragments {
            self.broadcast(packet.as_bytes(), None);
        }

        Ok(total)
    }

    /// Handle a buffer delivered by the radio.
    ///
    /// Rejected packets are counted and reported as errors; nothing is sent
    /// back to the source.
    pub fn on_receive(
        &mut self,
        channel: &SecureChannel,
        source: &PeerAddress,
        raw: &[u8],
    ) -> Result<Inbound, TransportError> {
        let TransportState::Active { role, .. } = self.state else {
            return Err(TransportError::NotActive);
        };

        self.stats.received += 1;
        debug!(target: "mesh", "message from {} with {} bytes", source, raw.len());

        let packet = match PacketCodec::new(channel).unframe(raw) {
            Ok(packet) => packet,
            Err(e) => {
                match e {
                    TransportError::LengthMismatch(..) => self.stats.dropped_length += 1,
                    TransportError::AuthenticationFailure => self.stats.dropped_auth += 1,
                    _ => {}
                }
                debug!(target: "mesh", "dropping packet from {}: {}", source, e);
                return Err(e);
            }
        };

        self.stats.accepted += 1;

        if role == Role::Controller {
            return Ok(Inbound::Uplink(packet.authenticated_bytes().to_vec()));
        }

        let payload = packet.trimmed_payload();
        let directed = contains_marker(payload, &destination_marker(&self.identity.identifier()));
        let broadcast = contains_marker(payload, &broadcast_marker());

        let relayed = if !directed || broadcast {
            let mut bytes = [0u8; PACKET_SIZE];
            bytes.copy_from_slice(raw);
            self.broadcast(&bytes, Some(source))
        } else {
            0
        };

        let command = (directed || broadcast).then(|| {
            debug!(target: "mesh", "handling command addressed to this node");
            strip_destination(payload).to_vec()
        });

        Ok(Inbound::Delivered { relayed, command })
    }

    /// Send completion notification. Logged only.
    pub fn on_send_complete(&mut self, destination: &PeerAddress, success: bool) {
        if success {
            trace!(target: "mesh", "send to {} completed", destination);
        } else {
            debug!(target: "mesh", "send to {} failed", destination);
        }
    }
}
