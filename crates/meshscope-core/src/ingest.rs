//! Per-message ingestion
//!
//! [`Ingestor`] turns one raw MQTT payload into committed topology state and one
//! published [`PacketRecord`]. Messages are processed strictly one at a time; every
//! mutation for a message happens inside a single [`crate::store::StoreTx`].

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::mesh::proto::PortNum;
use crate::mesh::{decode_envelope, CryptoContext, DecryptOutcome, Payload};
use crate::publish::{HopRecord, PacketPublisher, PacketRecord};
use crate::store::{LinkSource, PacketObservation, RecordOutcome, Store};

/// Port name used when the payload could not be decoded
pub const UNKNOWN_PORT: &str = "UNKNOWN";

/// Running counters, one increment per message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Messages committed and published
    pub processed: u64,
    /// Envelopes that failed to decode
    pub dropped: u64,
    /// Processed messages that repeated an earlier gateway observation
    pub duplicates: u64,
    /// Messages abandoned on a non-fatal error
    pub failed: u64,
}

/// Stream processor from raw envelopes to topology state
pub struct Ingestor<P> {
    store: Store,
    crypto: CryptoContext,
    publisher: P,
    stats: IngestStats,
}

impl<P: PacketPublisher> Ingestor<P> {
    /// Create an ingestor decrypting with the default channel key
    pub fn new(store: Store, publisher: P) -> Self {
        Self {
            store,
            crypto: CryptoContext::with_default_psk(),
            publisher,
            stats: IngestStats::default(),
        }
    }

    pub fn with_crypto(mut self, crypto: CryptoContext) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Process one message, logging and absorbing everything but fatal storage errors
    pub async fn handle(&mut self, payload: &[u8]) -> Result<()> {
        match self.process(payload).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => {
                error!("storage failure, stopping ingestion: {}", e);
                Err(e)
            }
            Err(e) => {
                warn!("message skipped: {}", e);
                self.stats.failed += 1;
                Ok(())
            }
        }
    }

    /// Process one message observed now
    pub async fn process(&mut self, payload: &[u8]) -> Result<Option<PacketRecord>> {
        self.process_at(payload, Utc::now()).await
    }

    /// Process one message observed at `seen_at`
    ///
    /// Returns `Ok(None)` when the envelope does not decode; the message is dropped.
    /// Any error leaves the store untouched.
    pub async fn process_at(
        &mut self,
        payload: &[u8],
        seen_at: DateTime<Utc>,
    ) -> Result<Option<PacketRecord>> {
        let mut envelope = match decode_envelope(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(len = payload.len(), "dropping undecodable envelope: {}", e);
                self.stats.dropped += 1;
                return Ok(None);
            }
        };
        let gateway = envelope.gateway;
        let from = envelope.packet.from;
        let to = envelope.packet.to;

        let mut tx = self.store.begin().await?;

        let replayed = {
            let packet = &envelope.packet;
            tx.upsert_gateway(gateway, seen_at).await?;
            tx.upsert_node(from, seen_at, packet.hop_start, packet.is_legacy())
                .await?;
            tx.touch_gateway_node(gateway, from, seen_at).await?;
            tx.has_observation(packet.id, from, to, gateway).await?
        };

        // a redelivered observation derives nothing new
        if !replayed {
            let packet = &envelope.packet;
            if packet.is_zero_hop() {
                tx.update_gateway_node_rx(gateway, from, packet.rx_rssi, packet.rx_snr, seen_at)
                    .await?;
            }
        }

        if let DecryptOutcome::Failed(reason) = envelope.decrypt(&self.crypto) {
            debug!(gateway = %gateway, from = %from, "treating payload as opaque: {}", reason);
        }
        let packet = &envelope.packet;

        let interpreted = packet.body.data().map(Payload::from_data);
        let payload_json = interpreted.as_ref().map(Payload::to_json);
        let port = packet
            .portnum()
            .map(PortNum::name_of)
            .unwrap_or(UNKNOWN_PORT);

        info!(
            gateway = %gateway,
            from = %from,
            to = %to,
            packet_id = format_args!("{:08x}", packet.id),
            rssi = packet.rx_rssi,
            snr = packet.rx_snr,
            hop_limit = packet.hop_limit,
            hop_start = packet.hop_start,
            port,
            "packet"
        );

        if let (false, Some(payload), Some(json)) = (replayed, &interpreted, &payload_json) {
            if let Some(blob) = payload.node_blob() {
                tx.set_node_blob(from, blob, json).await?;
            }

            for link in payload.neighbor_links(from) {
                tx.upsert_direct_link(
                    link.from,
                    link.to,
                    seen_at,
                    Some(link.snr),
                    None,
                    LinkSource::NeighborInfo,
                )
                .await?;
            }

            if let Some(report) = payload.route_report(from, to) {
                debug!("{}", report.format().trim_end());
                for link in report.links() {
                    tx.upsert_direct_link(
                        link.from,
                        link.to,
                        seen_at,
                        link.snr,
                        None,
                        LinkSource::Traceroute,
                    )
                    .await?;
                }
            }
        }

        let outcome = tx
            .record_packet(&PacketObservation {
                packet_id: packet.id,
                from,
                to,
                gateway,
                relay_node: packet.relay_node,
                length: packet.payload_len(),
                hop_start: packet.hop_start,
                hop_limit: packet.hop_limit,
                portnum: packet.portnum(),
                rssi: packet.rx_rssi,
                snr: packet.rx_snr,
                seen_at,
            })
            .await?;

        if !replayed && packet.is_zero_hop() && from != gateway {
            tx.upsert_direct_link(
                from,
                gateway,
                seen_at,
                Some(packet.rx_snr),
                Some(packet.rx_rssi),
                LinkSource::Gateway,
            )
            .await?;
        }

        tx.commit().await?;

        let hops: Vec<HopRecord> = self
            .store
            .packet_hops(packet.id, from, to)
            .await?
            .iter()
            .map(HopRecord::from)
            .collect();

        let record = PacketRecord {
            id: packet.id,
            first_seen: hops.iter().map(|h| h.seen_at).min().unwrap_or(seen_at),
            seen_at,
            from_id: from,
            to_id: to,
            want_ack: packet.want_ack,
            via_mqtt: packet.via_mqtt,
            hop_limit: packet.hop_limit,
            hop_start: packet.hop_start,
            port: port.to_string(),
            payload: payload_json,
            hops,
        };

        self.publisher.publish(gateway, &record);

        self.stats.processed += 1;
        if outcome == RecordOutcome::Duplicate {
            self.stats.duplicates += 1;
        }
        Ok(Some(record))
    }
}
