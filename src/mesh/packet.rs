//! Mesh wire format
//!
//! Every radio packet is exactly 250 bytes:
//!
//! ```text
//! | Offset    | Size | Field                                       |
//! |-----------|------|---------------------------------------------|
//! | 0 - 3     | 4    | Correlation id, big-endian                  |
//! | 4         | 1    | Fragment sequence number, starting at 1     |
//! | 5         | 1    | Total fragment count                        |
//! | 6 - 217   | 212  | Payload, zero padded                        |
//! | 218 - 249 | 32   | HMAC-SHA256 over bytes 0 - 217              |
//! ```
//!
//! A logical message is `topic || 0x01 || payload` (or just `payload`) split
//! into 212 byte fragments sharing one random correlation id. Fragments are
//! never reassembled on the mesh; the backend does that after the controller
//! forwards each authenticated fragment.

use std::fmt;
use std::iter::FusedIterator;

use super::crypto::{mac_equal, MacTag, SecureChannel, MAC_SIZE};
use super::error::TransportError;

/// Size of every radio packet
pub const PACKET_SIZE: usize = 250;

/// Correlation id, sequence number and total count
pub const HEADER_SIZE: usize = 6;

/// Usable payload bytes per packet
pub const PAYLOAD_SIZE: usize = PACKET_SIZE - HEADER_SIZE - MAC_SIZE;

/// Bytes covered by the MAC
pub const AUTHENTICATED_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// Fragment counts are a single byte
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// Largest logical message that can be framed
pub const MAX_MESSAGE_SIZE: usize = PAYLOAD_SIZE * MAX_FRAGMENTS;

/// Separates the topic from the payload in the first fragment
pub const TOPIC_SEPARATOR: u8 = 0x01;

/// Packet header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Random id shared by all fragments of one message
    pub correlation: u32,
    /// 1-based fragment number
    pub sequence: u8,
    /// Number of fragments in the message
    pub total: u8,
}

impl PacketHeader {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&self.correlation.to_be_bytes());
        header[4] = self.sequence;
        header[5] = self.total;
        header
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            correlation: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            sequence: bytes[4],
            total: bytes[5],
        }
    }
}

/// One authenticated 250 byte radio packet.
#[derive(Clone, PartialEq, Eq)]
pub struct WirePacket {
    bytes: [u8; PACKET_SIZE],
}

impl WirePacket {
    /// Build and MAC a packet. `payload` must fit in [`PAYLOAD_SIZE`].
    fn seal(header: PacketHeader, payload: &[u8], channel: &SecureChannel) -> Self {
        let mut bytes = [0u8; PACKET_SIZE];
        bytes[..HEADER_SIZE].copy_from_slice(&header.encode());
        bytes[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);

        let mac = channel.mac(&bytes[..AUTHENTICATED_SIZE]);
        bytes[AUTHENTICATED_SIZE..].copy_from_slice(&mac);

        Self { bytes }
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader::decode(&self.bytes[..HEADER_SIZE])
    }

    /// Zero padded payload region
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..AUTHENTICATED_SIZE]
    }

    pub fn mac(&self) -> &[u8] {
        &self.bytes[AUTHENTICATED_SIZE..]
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.bytes
    }
}

impl fmt::Debug for WirePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WirePacket")
            .field("header", &self.header())
            .finish_non_exhaustive()
    }
}

/// A received packet whose MAC verified.
#[derive(Clone, PartialEq, Eq)]
pub struct ValidatedPacket {
    bytes: [u8; AUTHENTICATED_SIZE],
}

impl ValidatedPacket {
    pub fn header(&self) -> PacketHeader {
        PacketHeader::decode(&self.bytes[..HEADER_SIZE])
    }

    /// The full 212 byte payload region, still zero padded.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }

    /// Payload with the trailing zero padding removed.
    ///
    /// The wire format carries no length, so a payload that itself ends in
    /// zero bytes cannot be told apart from padding.
    pub fn trimmed_payload(&self) -> &[u8] {
        let payload = self.payload();
        let end = payload
            .iter()
            .rposition(|b| *b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        &payload[..end]
    }

    /// Header and payload without the MAC.
    pub fn authenticated_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for ValidatedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedPacket")
            .field("header", &self.header())
            .field("payload_len", &self.trimmed_payload().len())
            .finish()
    }
}

/// Frames messages into packets and validates received packets.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec<'a> {
    channel: &'a SecureChannel,
}

impl<'a> PacketCodec<'a> {
    pub fn new(channel: &'a SecureChannel) -> Self {
        Self { channel }
    }

    /// Split a message into packets under a fresh random correlation id.
    ///
    /// An empty message still produces exactly one packet.
    pub fn frame(
        &self,
        payload: &[u8],
        topic: Option<&str>,
    ) -> Result<Fragments<'a>, TransportError> {
        self.frame_with_correlation(payload, topic, rand::random::<u32>())
    }

    /// Same as [`PacketCodec::frame`] with a caller chosen correlation id.
    pub fn frame_with_correlation(
        &self,
        payload: &[u8],
        topic: Option<&str>,
        correlation: u32,
    ) -> Result<Fragments<'a>, TransportError> {
        let message = match topic.filter(|t| !t.is_empty()) {
            Some(topic) => {
                let mut message = Vec::with_capacity(topic.len() + 1 + payload.len());
                message.extend_from_slice(topic.as_bytes());
                message.push(TOPIC_SEPARATOR);
                message.extend_from_slice(payload);
                message
            }
            None => payload.to_vec(),
        };

        if message.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge(
                message.len(),
                MAX_MESSAGE_SIZE,
            ));
        }

        let total = message.len().div_ceil(PAYLOAD_SIZE).max(1) as u8;

        Ok(Fragments {
            channel: self.channel,
            message,
            correlation,
            total,
            next: 1,
        })
    }

    /// Validate a received buffer.
    ///
    /// The MAC is checked before any payload byte is exposed.
    pub fn unframe(&self, raw: &[u8]) -> Result<ValidatedPacket, TransportError> {
        if raw.len() != PACKET_SIZE {
            return Err(TransportError::LengthMismatch(raw.len(), PACKET_SIZE));
        }

        let expected = self.channel.mac(&raw[..AUTHENTICATED_SIZE]);
        let mut received: MacTag = [0u8; MAC_SIZE];
        received.copy_from_slice(&raw[AUTHENTICATED_SIZE..]);

        if !mac_equal(&expected, &received) {
            return Err(TransportError::AuthenticationFailure);
        }

        let mut bytes = [0u8; AUTHENTICATED_SIZE];
        bytes.copy_from_slice(&raw[..AUTHENTICATED_SIZE]);
        Ok(ValidatedPacket { bytes })
    }
}

/// Packets of one logical message, produced in sequence order.
///
/// Each packet is sealed only when requested.
#[derive(Debug)]
pub struct Fragments<'a> {
    channel: &'a SecureChannel,
    message: Vec<u8>,
    correlation: u32,
    total: u8,
    /// Sequence number of the next packet; `total + 1` once exhausted
    next: u16,
}

impl Fragments<'_> {
    pub fn correlation(&self) -> u32 {
        self.correlation
    }

    pub fn total(&self) -> u8 {
        self.total
    }

    fn remaining(&self) -> usize {
        (self.total as usize + 1).saturating_sub(self.next as usize)
    }
}

impl Iterator for Fragments<'_> {
    type Item = WirePacket;

    fn next(&mut self) -> Option<WirePacket> {
        if self.remaining() == 0 {
            return None;
        }

        let sequence = self.next as u8;
        let index = (sequence - 1) as usize;
        let start = (index * PAYLOAD_SIZE).min(self.message.len());
        let end = (start + PAYLOAD_SIZE).min(self.message.len());

        let header = PacketHeader {
            correlation: self.correlation,
            sequence,
            total: self.total,
        };
        let packet = WirePacket::seal(header, &self.message[start..end], self.channel);
        self.next += 1;

        Some(packet)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Fragments<'_> {}

impl FusedIterator for Fragments<'_> {}
