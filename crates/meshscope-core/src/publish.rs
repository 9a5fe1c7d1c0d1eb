//! Outbound packet records and the fan-out boundary
//!
//! After each message commits, the ingestor assembles a [`PacketRecord`] and hands it to
//! a [`PacketPublisher`]. Delivery, subscriber bookkeeping and backpressure live on the
//! other side of that trait. [`BroadcastPublisher`] is the in-process implementation:
//! a `tokio::sync::broadcast` channel that subscribers filter by gateway.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::mesh::NodeId;
use crate::store::PacketGatewayLink;

/// One gateway's observation of a packet, as published
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HopRecord {
    pub gateway_id: NodeId,
    pub seen_at: DateTime<Utc>,
    pub hop_limit: u32,
    pub rssi: i32,
    pub snr: f32,
    pub relay_node: Option<u32>,
}

impl From<&PacketGatewayLink> for HopRecord {
    fn from(link: &PacketGatewayLink) -> Self {
        Self {
            gateway_id: link.gateway_id,
            seen_at: link.seen_at,
            hop_limit: link.hop_limit,
            rssi: link.rssi,
            snr: link.snr,
            relay_node: link.relay_node,
        }
    }
}

/// Fully decoded packet with every gateway observation collected so far
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketRecord {
    pub id: u32,
    /// Earliest observation by any gateway
    pub first_seen: DateTime<Utc>,
    /// Time of the observation that triggered this record
    pub seen_at: DateTime<Utc>,
    pub from_id: NodeId,
    pub to_id: NodeId,
    pub want_ack: bool,
    pub via_mqtt: bool,
    pub hop_limit: u32,
    pub hop_start: u32,
    /// Port name, `UNKNOWN` when the payload could not be decoded
    pub port: String,
    pub payload: Option<Value>,
    /// Ordered by hop limit, closest to the destination first
    pub hops: Vec<HopRecord>,
}

/// Receives one record per processed message
pub trait PacketPublisher {
    fn publish(&self, gateway: NodeId, record: &PacketRecord);
}

impl<P: PacketPublisher + ?Sized> PacketPublisher for Arc<P> {
    fn publish(&self, gateway: NodeId, record: &PacketRecord) {
        (**self).publish(gateway, record)
    }
}

/// Publisher that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

impl PacketPublisher for NullPublisher {
    fn publish(&self, _gateway: NodeId, _record: &PacketRecord) {}
}

/// A record tagged with the gateway whose message produced it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedPacket {
    pub gateway: NodeId,
    pub record: PacketRecord,
}

impl PublishedPacket {
    /// Whether a subscriber with `filter` should receive this packet
    ///
    /// `*` matches everything; otherwise the filter is a gateway id in any accepted
    /// node id form (`a1`, `000000a1`, `!000000a1`).
    pub fn matches(&self, filter: &str) -> bool {
        filter == "*"
            || filter
                .parse::<NodeId>()
                .map(|id| id == self.gateway)
                .unwrap_or(false)
    }
}

/// In-process fan-out over a broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Arc<PublishedPacket>>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<PublishedPacket>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl PacketPublisher for BroadcastPublisher {
    /// With no subscribers the record is dropped silently
    fn publish(&self, gateway: NodeId, record: &PacketRecord) {
        let _ = self.tx.send(Arc::new(PublishedPacket {
            gateway,
            record: record.clone(),
        }));
    }
}
