//! Private Mesh Protocol for Authenticated Radio Messaging
//!
//! This module provides the link between garden nodes: fixed-size radio
//! packets authenticated with a shared root key, fragmentation of larger
//! messages, the encrypted command channel, and the peer table.
//!
//! # Architecture
//!
//! The mesh protocol uses:
//! - **HMAC-SHA256**: Authenticates every 250 byte packet with the root key
//! - **ChaCha20-Poly1305**: Seals commands with a key derived from the root key
//! - **Star topology**: Clients send uplink data to one controller, which
//!   bridges it to the broker
//!
//! # Packet Layout
//!
//! | Bytes     | Field                              |
//! |-----------|------------------------------------|
//! | 0..4      | Correlation id, big-endian         |
//! | 4         | Sequence number, 1-based           |
//! | 5         | Total fragments                    |
//! | 6..218    | Payload, zero padded               |
//! | 218..250  | HMAC-SHA256 over bytes 0..218      |
//!
//! # Security Properties
//!
//! - **Integrity**: Packets without a valid MAC are dropped before any parsing
//! - **Confidentiality**: Commands may be sealed end to end
//! - **Membership**: Only holders of the root key can inject packets
//!
//! Replay protection and reassembly of fragments are left to the receiver of
//! uplink data.
//!
//! # Example
//!
//! ```
//! use garden_node::mesh::crypto::SecureChannel;
//! use garden_node::mesh::packet::PacketCodec;
//!
//! let channel = SecureChannel::new(b"garden-root-key").unwrap();
//! let codec = PacketCodec::new(&channel);
//!
//! let fragments: Vec<_> = codec.frame(&[7u8; 600], None).unwrap().collect();
//! assert_eq!(fragments.len(), 3);
//!
//! let packet = codec.unframe(fragments[0].as_bytes()).unwrap();
//! assert_eq!(packet.header().sequence, 1);
//! ```

pub mod crypto;
pub mod error;
pub mod packet;
pub mod peers;
pub mod transport;

pub use crypto::{KeyRing, SecureChannel};
pub use error::{ConfigError, CryptoError, TransportError};
pub use packet::{PacketCodec, ValidatedPacket, WirePacket};
pub use peers::{PeerAddress, PeerRegistry};
pub use transport::{Inbound, MeshTransport, Role};
