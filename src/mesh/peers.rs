//! Peer addresses and peer membership
//!
//! The registry keeps two ordered sets:
//!
//! - **known**: every address this node accepts as a mesh member. Rebuilt
//!   wholesale from the stored controller address and peer list.
//! - **paired**: addresses registered with the radio's own peer table and
//!   therefore eligible for direct send. Grows as peers are paired and is
//!   never pruned.

use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use super::error::ConfigError;
use crate::platform::Radio;

/// Leading marker on a stored peer entry that should also be paired
pub const PAIR_MARKER: char = '*';

/// A 6-byte radio hardware address.
///
/// Never all-zero and never the all-ones broadcast address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress([u8; 6]);

impl PeerAddress {
    /// Validate raw octets.
    pub fn from_bytes(octets: [u8; 6]) -> Result<Self, ConfigError> {
        if octets == [0u8; 6] || octets == [0xffu8; 6] {
            return Err(ConfigError::ReservedAddress(format_octets(&octets)));
        }
        Ok(Self(octets))
    }

    /// Parse six colon separated two-digit hex octets.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let malformed = || ConfigError::MalformedAddress(text.to_string());

        let trimmed = text.trim();
        let mut octets = [0u8; 6];
        let mut parts = trimmed.split(':');

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(malformed)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(malformed());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| malformed())?;
        }

        if parts.next().is_some() {
            return Err(malformed());
        }

        Self::from_bytes(octets)
    }

    /// Parse a 12 hex digit node identifier (an address without colons).
    pub fn from_identifier(identifier: &str) -> Result<Self, ConfigError> {
        let decoded = hex::decode(identifier.trim())
            .map_err(|_| ConfigError::MalformedAddress(identifier.to_string()))?;
        let octets: [u8; 6] = decoded
            .try_into()
            .map_err(|_| ConfigError::MalformedAddress(identifier.to_string()))?;
        Self::from_bytes(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Node identifier: the address as 12 uppercase hex digits.
    pub fn identifier(&self) -> String {
        hex::encode_upper(self.0)
    }
}

fn format_octets(octets: &[u8; 6]) -> String {
    octets
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_octets(&self.0))
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self)
    }
}

impl FromStr for PeerAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Known and paired mesh peers.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    /// Channel peers are registered on
    channel: u8,

    /// Accepted mesh members
    known: Vec<PeerAddress>,

    /// Peers registered with the radio
    paired: Vec<PeerAddress>,
}

impl PeerRegistry {
    pub fn new(channel: u8) -> Self {
        Self {
            channel,
            known: Vec::new(),
            paired: Vec::new(),
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub(crate) fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    /// Rebuild the known set from the stored controller address and the
    /// comma separated peer list.
    ///
    /// Entries starting with `*` are also paired with the radio. Entries that
    /// do not parse are skipped. Returns the number of known peers.
    pub fn load_known(
        &mut self,
        controller: &str,
        peers: &str,
        radio: &mut dyn Radio,
    ) -> usize {
        debug!(target: "mesh", "loading peer list");
        self.known.clear();

        let controller = controller.trim();
        let entries = std::iter::once(controller).chain(peers.split(','));

        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let (pair, text) = match entry.strip_prefix(PAIR_MARKER) {
                Some(rest) => (true, rest),
                None => (false, entry),
            };

            let address = match PeerAddress::parse(text) {
                Ok(address) => address,
                Err(e) => {
                    warn!(target: "mesh", "skipping peer entry: {}", e);
                    continue;
                }
            };

            if pair {
                self.pair(&address, radio);
            }

            if !self.known.contains(&address) {
                self.known.push(address);
            }
        }

        debug!(target: "mesh", "found {} peers", self.known.len());
        self.known.len()
    }

    /// Case-insensitive membership test.
    pub fn is_known(&self, address: &str) -> bool {
        match PeerAddress::parse(address) {
            Ok(address) => self.contains(&address),
            Err(_) => false,
        }
    }

    pub fn contains(&self, address: &PeerAddress) -> bool {
        self.known.contains(address)
    }

    /// Parse and pair an address given as text.
    pub fn pair_text(&mut self, text: &str, radio: &mut dyn Radio) -> bool {
        match PeerAddress::parse(text) {
            Ok(address) => self.pair(&address, radio),
            Err(e) => {
                warn!(target: "mesh", "failed to add peer: {}", e);
                false
            }
        }
    }

    /// Register `address` with the radio on the mesh channel and remember it
    /// as paired. State is unchanged if registration fails.
    pub fn pair(&mut self, address: &PeerAddress, radio: &mut dyn Radio) -> bool {
        if let Err(e) = radio.register_peer(address, self.channel) {
            warn!(target: "mesh", "failed to add peer {}: {}", address, e);
            return false;
        }

        if !self.paired.contains(address) {
            self.paired.push(*address);
        }

        debug!(target: "mesh", "peer {} added", address);
        true
    }

    pub fn known(&self) -> &[PeerAddress] {
        &self.known
    }

    pub fn paired(&self) -> &[PeerAddress] {
        &self.paired
    }
}
