//! Node identifiers and the decoded view of a mesh packet
//!
//! Meshtastic addresses nodes with a 32-bit number, usually written as eight hex digits
//! with a leading `!` (`!a1b2c3d4`). Gateways publish their own id in that textual form
//! inside the MQTT envelope, while packet headers carry the raw integer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::proto::{self, mesh_packet::PayloadVariant};

/// Node identifier - 32-bit mesh address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// Broadcast address (all 0xFF)
    pub const BROADCAST: NodeId = NodeId(0xFFFF_FFFF);

    /// Create a NodeId from a u32
    pub const fn from_u32(value: u32) -> Self {
        NodeId(value)
    }

    /// Convert to u32
    pub const fn to_u32(self) -> u32 {
        self.0
    }

    /// Widened form used as a SQLite integer key
    pub fn to_i64(self) -> i64 {
        i64::from(self.0)
    }

    /// Check if this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId(value)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:08x})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Error parsing a textual node id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseNodeIdError(pub String);

impl fmt::Display for ParseNodeIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node id {:?}", self.0)
    }
}

impl std::error::Error for ParseNodeIdError {}

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    /// Accepts `!a1b2c3d4`, `a1b2c3d4` and `0xa1b2c3d4`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix('!')
            .or_else(|| trimmed.strip_prefix("0x"))
            .unwrap_or(trimmed);
        if digits.is_empty() || digits.len() > 8 {
            return Err(ParseNodeIdError(s.to_string()));
        }
        u32::from_str_radix(digits, 16)
            .map(NodeId)
            .map_err(|_| ParseNodeIdError(s.to_string()))
    }
}

/// Packet payload as carried on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    /// Cleartext application data
    Decoded(proto::Data),
    /// Channel-encrypted bytes that have not (yet) been decrypted
    Encrypted(Vec<u8>),
    /// Neither variant present
    Empty,
}

impl PacketBody {
    /// The decoded data, if any
    pub fn data(&self) -> Option<&proto::Data> {
        match self {
            PacketBody::Decoded(data) => Some(data),
            _ => None,
        }
    }
}

/// Routing metadata and payload of one mesh packet as reported by one gateway
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedPacket {
    /// 32-bit packet id (reused over time and across senders)
    pub id: u32,
    pub from: NodeId,
    pub to: NodeId,
    pub channel: u32,
    pub want_ack: bool,
    pub via_mqtt: bool,
    pub hop_start: u32,
    pub hop_limit: u32,
    pub rx_rssi: i32,
    pub rx_snr: f32,
    /// Last byte of the relaying node, if the firmware reported one
    pub relay_node: Option<u32>,
    pub body: PacketBody,
}

impl ObservedPacket {
    /// Heard directly by the gateway: no hop was consumed
    pub fn is_zero_hop(&self) -> bool {
        self.hop_limit == self.hop_start
    }

    /// Pre-2.3 firmware does not fill in `hop_start`
    pub fn is_legacy(&self) -> bool {
        self.hop_start == 0 && self.hop_limit != 0
    }

    /// Hops travelled before reaching the gateway, when knowable
    pub fn hops_away(&self) -> Option<u32> {
        if self.hop_start == 0 {
            None
        } else {
            self.hop_start.checked_sub(self.hop_limit)
        }
    }

    /// Application port, if the payload is decoded
    pub fn portnum(&self) -> Option<i32> {
        self.body.data().map(|d| d.portnum)
    }

    /// Payload length in bytes, or -1 when the payload is not decoded
    pub fn payload_len(&self) -> i64 {
        self.body
            .data()
            .map(|d| d.payload.len() as i64)
            .unwrap_or(-1)
    }
}

impl From<proto::MeshPacket> for ObservedPacket {
    fn from(mp: proto::MeshPacket) -> Self {
        let body = match mp.payload_variant {
            Some(PayloadVariant::Decoded(data)) => PacketBody::Decoded(data),
            Some(PayloadVariant::Encrypted(bytes)) => PacketBody::Encrypted(bytes),
            None => PacketBody::Empty,
        };
        Self {
            id: mp.id,
            from: NodeId(mp.from),
            to: NodeId(mp.to),
            channel: mp.channel,
            want_ack: mp.want_ack,
            via_mqtt: mp.via_mqtt,
            hop_start: mp.hop_start,
            hop_limit: mp.hop_limit,
            rx_rssi: mp.rx_rssi,
            rx_snr: mp.rx_snr,
            relay_node: (mp.relay_node != 0).then_some(mp.relay_node),
            body,
        }
    }
}
