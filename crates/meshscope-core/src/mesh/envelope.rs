//! MQTT service envelope decoding
//!
//! A gateway publishes every packet it hears wrapped in a `ServiceEnvelope`. Decoding
//! yields the observing gateway's id and the packet's routing metadata. Encrypted bodies
//! are decrypted opportunistically with the default channel key; a failed decryption
//! leaves the body opaque but never rejects the envelope.

use prost::Message;
use tracing::debug;

use super::crypto::CryptoContext;
use super::packet::{NodeId, ObservedPacket, PacketBody};
use super::proto::ServiceEnvelope;
use crate::error::{IngestError, Result};

/// A decoded envelope: who saw it, and what they saw
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEnvelope {
    /// Observing gateway
    pub gateway: NodeId,
    /// Channel name the gateway uplinked on
    pub channel_id: String,
    pub packet: ObservedPacket,
}

/// What happened to the packet body during decryption
#[derive(Debug, Clone, PartialEq)]
pub enum DecryptOutcome {
    /// Body was already cleartext
    AlreadyDecoded,
    /// Body was encrypted and is now decoded
    Decrypted,
    /// Body is encrypted and stays opaque
    Failed(String),
    /// No body at all
    NoPayload,
}

/// Parse one raw envelope
///
/// Malformed protobuf, a missing packet, and an unparsable gateway id are all decode
/// failures; the caller drops the message.
pub fn decode_envelope(bytes: &[u8]) -> Result<DecodedEnvelope> {
    let envelope = ServiceEnvelope::decode(bytes)?;
    let gateway: NodeId = envelope.gateway_id.parse()?;
    let packet = envelope.packet.ok_or(IngestError::MissingPacket)?;

    Ok(DecodedEnvelope {
        gateway,
        channel_id: envelope.channel_id,
        packet: ObservedPacket::from(packet),
    })
}

impl DecodedEnvelope {
    /// Decrypt the packet body in place if it is encrypted
    pub fn decrypt(&mut self, crypto: &CryptoContext) -> DecryptOutcome {
        let packet = &mut self.packet;
        let ciphertext = match &packet.body {
            PacketBody::Decoded(_) => return DecryptOutcome::AlreadyDecoded,
            PacketBody::Empty => return DecryptOutcome::NoPayload,
            PacketBody::Encrypted(bytes) => bytes,
        };

        match crypto.decrypt_data(ciphertext, packet.id, packet.from) {
            Ok(data) => {
                debug!(
                    packet_id = packet.id,
                    from = %packet.from,
                    portnum = data.portnum,
                    "decrypted payload with default key"
                );
                packet.body = PacketBody::Decoded(data);
                DecryptOutcome::Decrypted
            }
            Err(e) => {
                debug!(packet_id = packet.id, from = %packet.from, "payload stays opaque: {}", e);
                DecryptOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::proto::{mesh_packet::PayloadVariant, Data, MeshPacket, PortNum};

    fn envelope(gateway_id: &str, variant: Option<PayloadVariant>) -> Vec<u8> {
        ServiceEnvelope {
            packet: Some(MeshPacket {
                from: 0xb2,
                to: 0xffff_ffff,
                id: 77,
                hop_start: 3,
                hop_limit: 2,
                rx_rssi: -101,
                rx_snr: 4.25,
                relay_node: 0x5c,
                payload_variant: variant,
                ..Default::default()
            }),
            channel_id: "LongFast".into(),
            gateway_id: gateway_id.into(),
        }
        .encode_to_vec()
    }

    #[test]
    fn test_decode_envelope_fields() {
        let data = Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: b"hi".to_vec(),
            ..Default::default()
        };
        let bytes = envelope("!000000a1", Some(PayloadVariant::Decoded(data.clone())));

        let decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded.gateway, NodeId::from_u32(0xa1));
        assert_eq!(decoded.channel_id, "LongFast");
        assert_eq!(decoded.packet.from, NodeId::from_u32(0xb2));
        assert_eq!(decoded.packet.to, NodeId::BROADCAST);
        assert_eq!(decoded.packet.hop_start, 3);
        assert_eq!(decoded.packet.hop_limit, 2);
        assert_eq!(decoded.packet.rx_rssi, -101);
        assert_eq!(decoded.packet.relay_node, Some(0x5c));
        assert_eq!(decoded.packet.body, PacketBody::Decoded(data));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode_envelope(&[0xff, 0xff, 0xff, 0x01]).is_err());
    }

    #[test]
    fn test_bad_gateway_id_is_rejected() {
        let bytes = envelope("gateway-one", None);
        assert!(matches!(
            decode_envelope(&bytes),
            Err(IngestError::InvalidGateway(_))
        ));
    }

    #[test]
    fn test_missing_packet_is_rejected() {
        let bytes = ServiceEnvelope {
            packet: None,
            channel_id: String::new(),
            gateway_id: "!000000a1".into(),
        }
        .encode_to_vec();
        assert!(matches!(decode_envelope(&bytes), Err(IngestError::MissingPacket)));
    }

    #[cfg(feature = "crypto")]
    #[test]
    fn test_decrypts_default_key_payload() {
        let crypto = CryptoContext::with_default_psk();
        let data = Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: b"over the air".to_vec(),
            ..Default::default()
        };
        let ciphertext = crypto.apply_keystream(&data.encode_to_vec(), 77, NodeId::from_u32(0xb2));
        let bytes = envelope("!000000a1", Some(PayloadVariant::Encrypted(ciphertext)));

        let mut decoded = decode_envelope(&bytes).unwrap();
        assert_eq!(decoded.decrypt(&crypto), DecryptOutcome::Decrypted);
        assert_eq!(decoded.packet.body, PacketBody::Decoded(data));
        assert_eq!(decoded.decrypt(&crypto), DecryptOutcome::AlreadyDecoded);
    }

    #[test]
    fn test_no_payload() {
        let mut decoded = decode_envelope(&envelope("!000000a1", None)).unwrap();
        assert_eq!(decoded.decrypt(&CryptoContext::default()), DecryptOutcome::NoPayload);
    }
}
