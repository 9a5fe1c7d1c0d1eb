//! End-to-end ingestion tests.
//!
//! Envelopes are built with prost, pushed through an `Ingestor` backed by an in-memory
//! store, and checked against both the store and the published records.

use chrono::{Duration, TimeZone, Utc};
use meshscope_core::mesh::proto::{
    mesh_packet::PayloadVariant, Data, MeshPacket, Neighbor, NeighborInfo, PortNum,
    RouteDiscovery, ServiceEnvelope, User,
};
use meshscope_core::{
    Ingestor, LinkSource, NodeId, PacketPublisher, PacketRecord, Store,
};
use prost::Message;
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorder {
    records: Mutex<Vec<(NodeId, PacketRecord)>>,
}

impl Recorder {
    fn take(&self) -> Vec<(NodeId, PacketRecord)> {
        std::mem::take(&mut *self.records.lock().unwrap())
    }
}

impl PacketPublisher for Recorder {
    fn publish(&self, gateway: NodeId, record: &PacketRecord) {
        self.records.lock().unwrap().push((gateway, record.clone()));
    }
}

fn id(n: u32) -> NodeId {
    NodeId::from_u32(n)
}

async fn ingestor() -> (Ingestor<Arc<Recorder>>, Arc<Recorder>) {
    let store = Store::open_in_memory().await.expect("in-memory store");
    let recorder = Arc::new(Recorder::default());
    (Ingestor::new(store, recorder.clone()), recorder)
}

fn data(port: PortNum, payload: Vec<u8>) -> Data {
    Data {
        portnum: port as i32,
        payload,
        ..Default::default()
    }
}

fn mesh_packet(packet_id: u32, from: u32, to: u32, hop_start: u32, hop_limit: u32) -> MeshPacket {
    MeshPacket {
        id: packet_id,
        from,
        to,
        hop_start,
        hop_limit,
        rx_rssi: -97,
        rx_snr: 5.25,
        ..Default::default()
    }
}

fn envelope(gateway: &str, mut packet: MeshPacket, body: Option<Data>) -> Vec<u8> {
    packet.payload_variant = body.map(PayloadVariant::Decoded);
    ServiceEnvelope {
        packet: Some(packet),
        channel_id: "LongFast".into(),
        gateway_id: gateway.into(),
    }
    .encode_to_vec()
}

fn text_from_b2(gateway: &str, hop_limit: u32) -> Vec<u8> {
    envelope(
        gateway,
        mesh_packet(0x1234, 0xb2, 0xffff_ffff, 3, hop_limit),
        Some(data(PortNum::TextMessageApp, b"hi".to_vec())),
    )
}

#[tokio::test]
async fn test_zero_hop_text_message() {
    let (mut ingestor, recorder) = ingestor().await;

    ingestor
        .process(&text_from_b2("!000000a1", 3))
        .await
        .expect("process")
        .expect("record");

    let store = ingestor.store();
    let node = store.node(id(0xb2)).await.unwrap().expect("sender node");
    assert!(!node.legacy);
    assert_eq!(node.hop_limit, Some(3));
    assert_eq!(node.message_count, 1);

    let packet = store
        .packet(0x1234, id(0xb2), NodeId::BROADCAST)
        .await
        .unwrap()
        .expect("packet row");
    assert_eq!(packet.portnum, Some(PortNum::TextMessageApp as i32));
    assert_eq!(packet.length, 2);

    let hops = store.packet_hops(0x1234, id(0xb2), NodeId::BROADCAST).await.unwrap();
    assert_eq!(hops.len(), 1);
    assert_eq!(hops[0].gateway_id, id(0xa1));

    let link = store
        .direct_link(id(0xb2), id(0xa1))
        .await
        .unwrap()
        .expect("gateway link");
    assert_eq!(link.source, LinkSource::Gateway);
    assert_eq!(link.last_snr, Some(5.25));
    assert_eq!(link.last_rssi, Some(-97));
    assert_eq!(link.observation_count, 1);

    // gateway becomes a placeholder node so the link has both endpoints
    assert!(store.node(id(0xa1)).await.unwrap().expect("gateway node").is_placeholder());

    let heard = store.gateway_links(id(0xb2)).await.unwrap();
    assert_eq!(heard[0].rssi, Some(-97));

    let published = recorder.take();
    assert_eq!(published.len(), 1);
    let (gateway, record) = &published[0];
    assert_eq!(*gateway, id(0xa1));
    assert_eq!(record.port, "TEXT_MESSAGE_APP");
    assert_eq!(record.payload, Some(json!({"message": "hi"})));
    assert_eq!(record.hops.len(), 1);
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let (mut ingestor, recorder) = ingestor().await;
    let bytes = text_from_b2("!000000a1", 3);

    ingestor.process(&bytes).await.unwrap();
    ingestor.process(&bytes).await.unwrap();

    let store = ingestor.store();
    let hops = store.packet_hops(0x1234, id(0xb2), NodeId::BROADCAST).await.unwrap();
    assert_eq!(hops.len(), 1);
    assert_eq!(store.node(id(0xb2)).await.unwrap().unwrap().message_count, 1);

    let stats = ingestor.stats();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(recorder.take().len(), 2);
}

#[tokio::test]
async fn test_second_gateway_adds_hop() {
    let (mut ingestor, recorder) = ingestor().await;

    ingestor.process(&text_from_b2("!000000a1", 3)).await.unwrap();
    ingestor.process(&text_from_b2("!000000a2", 1)).await.unwrap();

    let store = ingestor.store();
    assert_eq!(store.node(id(0xb2)).await.unwrap().unwrap().message_count, 2);
    // relayed copy does not make a gateway link to a2
    assert!(store.direct_link(id(0xb2), id(0xa2)).await.unwrap().is_none());

    let published = recorder.take();
    let (gateway, last) = published.last().expect("record");
    assert_eq!(*gateway, id(0xa2));
    let order: Vec<_> = last.hops.iter().map(|h| (h.gateway_id, h.hop_limit)).collect();
    assert_eq!(order, vec![(id(0xa2), 1), (id(0xa1), 3)]);
    assert!(last.first_seen <= last.seen_at);
}

#[tokio::test]
async fn test_packet_id_reuse_across_senders() {
    let (mut ingestor, _) = ingestor().await;

    let from_b2 = envelope("!000000a1", mesh_packet(77, 0xb2, 0xffff_ffff, 3, 2), None);
    let from_c3 = envelope("!000000a1", mesh_packet(77, 0xc3, 0xffff_ffff, 3, 2), None);
    ingestor.process(&from_b2).await.unwrap();
    ingestor.process(&from_c3).await.unwrap();

    let store = ingestor.store();
    assert!(store.packet(77, id(0xb2), NodeId::BROADCAST).await.unwrap().is_some());
    assert!(store.packet(77, id(0xc3), NodeId::BROADCAST).await.unwrap().is_some());
    assert_eq!(store.node(id(0xc3)).await.unwrap().unwrap().message_count, 1);
    assert_eq!(ingestor.stats().duplicates, 0);
}

#[tokio::test]
async fn test_neighbor_info_links() {
    let (mut ingestor, recorder) = ingestor().await;

    let info = NeighborInfo {
        node_id: 0xb2,
        neighbors: vec![Neighbor {
            node_id: 0xc3,
            snr: 2.0,
            ..Default::default()
        }],
        ..Default::default()
    };
    let bytes = envelope(
        "!000000a1",
        mesh_packet(5, 0xb2, 0xffff_ffff, 3, 1),
        Some(data(PortNum::NeighborinfoApp, info.encode_to_vec())),
    );
    ingestor.process(&bytes).await.unwrap();

    let store = ingestor.store();
    let link = store
        .direct_link(id(0xc3), id(0xb2))
        .await
        .unwrap()
        .expect("neighbor link");
    assert_eq!(link.source, LinkSource::NeighborInfo);
    assert_eq!(link.last_snr, Some(2.0));
    assert_eq!(link.last_rssi, None);
    assert!(store.direct_link(id(0xb2), id(0xc3)).await.unwrap().is_none());
    assert!(store.node(id(0xc3)).await.unwrap().unwrap().is_placeholder());

    let (_, record) = &recorder.take()[0];
    assert_eq!(record.port, "NEIGHBORINFO_APP");
    assert_eq!(record.payload.as_ref().unwrap()["neighbors"][0]["node_id"], 0xc3);
}

#[tokio::test]
async fn test_replayed_neighbor_info_changes_no_links() {
    let (mut ingestor, recorder) = ingestor().await;

    let info = NeighborInfo {
        node_id: 0xb2,
        neighbors: vec![Neighbor {
            node_id: 0xc3,
            snr: 2.0,
            ..Default::default()
        }],
        ..Default::default()
    };
    let bytes = envelope(
        "!000000a1",
        mesh_packet(6, 0xb2, 0xffff_ffff, 3, 3),
        Some(data(PortNum::NeighborinfoApp, info.encode_to_vec())),
    );
    let first = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    ingestor.process_at(&bytes, first).await.unwrap();
    ingestor
        .process_at(&bytes, first + Duration::seconds(30))
        .await
        .unwrap();

    let store = ingestor.store();
    let neighbor = store.direct_link(id(0xc3), id(0xb2)).await.unwrap().unwrap();
    assert_eq!(neighbor.observation_count, 1);
    assert_eq!(neighbor.last_seen, first);

    let heard = store.direct_link(id(0xb2), id(0xa1)).await.unwrap().unwrap();
    assert_eq!(heard.source, LinkSource::Gateway);
    assert_eq!(heard.observation_count, 1);
    assert_eq!(heard.last_seen, first);

    assert_eq!(store.node(id(0xb2)).await.unwrap().unwrap().message_count, 1);
    assert_eq!(ingestor.stats().duplicates, 1);
    // the replay is still published
    assert_eq!(recorder.take().len(), 2);
}

fn traceroute_reply(route: RouteDiscovery) -> Vec<u8> {
    // reply from target d4 back to initiator b2, heard relayed
    envelope(
        "!000000a1",
        mesh_packet(9, 0xd4, 0xb2, 3, 1),
        Some(data(PortNum::TracerouteApp, route.encode_to_vec())),
    )
}

#[tokio::test]
async fn test_traceroute_round_trip_edges() {
    let (mut ingestor, _) = ingestor().await;

    let route = RouteDiscovery {
        route: vec![0x10, 0x11],
        snr_towards: vec![8, 12, 20],
        route_back: vec![0x12, 0x13],
        snr_back: vec![4, 16, 24],
    };
    ingestor.process(&traceroute_reply(route)).await.unwrap();

    let store = ingestor.store();
    let since = Utc::now() - Duration::hours(1);
    let links = store.direct_links_since(since).await.unwrap();
    assert_eq!(links.len(), 2 * (2 + 1));
    assert!(links.iter().all(|l| l.source == LinkSource::Traceroute));

    let expected = [
        (0xb2, 0x10, 2.0),
        (0x10, 0x11, 3.0),
        (0x11, 0xd4, 5.0),
        (0xd4, 0x12, 1.0),
        (0x12, 0x13, 4.0),
        (0x13, 0xb2, 6.0),
    ];
    for (from, to, snr) in expected {
        let link = store
            .direct_link(id(from), id(to))
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("missing {:x} -> {:x}", from, to));
        assert_eq!(link.last_snr, Some(snr));
        assert_eq!(link.last_rssi, None);
    }
}

#[tokio::test]
async fn test_traceroute_sentinel_and_broadcast() {
    let (mut ingestor, _) = ingestor().await;

    let route = RouteDiscovery {
        route: vec![0x10, 0xffff_ffff],
        snr_towards: vec![-128, 8, 8],
        ..Default::default()
    };
    // towards-only record travelling from b2 to d4
    let bytes = envelope(
        "!000000a1",
        mesh_packet(10, 0xb2, 0xd4, 3, 1),
        Some(data(PortNum::TracerouteApp, route.encode_to_vec())),
    );
    ingestor.process(&bytes).await.unwrap();

    let store = ingestor.store();
    let first = store.direct_link(id(0xb2), id(0x10)).await.unwrap().unwrap();
    assert_eq!(first.last_snr, None);

    let since = Utc::now() - Duration::hours(1);
    let links = store.direct_links_since(since).await.unwrap();
    assert_eq!(links.len(), 1);
    assert!(store.node(NodeId::BROADCAST).await.unwrap().is_none());
}

#[tokio::test]
async fn test_empty_traceroute_request_has_no_edges() {
    let (mut ingestor, recorder) = ingestor().await;

    let bytes = envelope(
        "!000000a1",
        mesh_packet(11, 0xb2, 0xd4, 3, 2),
        Some(data(PortNum::TracerouteApp, Vec::new())),
    );
    ingestor.process(&bytes).await.unwrap();

    let since = Utc::now() - Duration::hours(1);
    assert!(ingestor.store().direct_links_since(since).await.unwrap().is_empty());
    let (_, record) = &recorder.take()[0];
    assert_eq!(record.port, "TRACEROUTE_APP");
}

#[tokio::test]
async fn test_gateway_hearing_itself_makes_no_self_link() {
    let (mut ingestor, _) = ingestor().await;

    let bytes = envelope(
        "!000000a1",
        mesh_packet(12, 0xa1, 0xffff_ffff, 3, 3),
        Some(data(PortNum::TextMessageApp, b"self".to_vec())),
    );
    ingestor.process(&bytes).await.unwrap();

    let store = ingestor.store();
    assert!(store.direct_link(id(0xa1), id(0xa1)).await.unwrap().is_none());
    let since = Utc::now() - Duration::hours(1);
    assert!(store.direct_links_since(since).await.unwrap().is_empty());
    assert_eq!(store.node(id(0xa1)).await.unwrap().unwrap().message_count, 1);
}

#[tokio::test]
async fn test_legacy_sender() {
    let (mut ingestor, _) = ingestor().await;

    let bytes = envelope("!000000a1", mesh_packet(13, 0xe5, 0xffff_ffff, 0, 3), None);
    ingestor.process(&bytes).await.unwrap();

    let store = ingestor.store();
    let node = store.node(id(0xe5)).await.unwrap().unwrap();
    assert!(node.legacy);
    assert_eq!(node.hop_limit, Some(0));
    // hop limit differs from hop start, so not a direct reception
    assert!(store.direct_link(id(0xe5), id(0xa1)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_node_info_updates_node() {
    let (mut ingestor, recorder) = ingestor().await;

    let user = User {
        id: "!000000b2".into(),
        long_name: "Ridge Relay".into(),
        short_name: "RR".into(),
        macaddr: vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
        ..Default::default()
    };
    let bytes = envelope(
        "!000000a1",
        mesh_packet(14, 0xb2, 0xffff_ffff, 3, 2),
        Some(data(PortNum::NodeinfoApp, user.encode_to_vec())),
    );
    ingestor.process(&bytes).await.unwrap();

    let node = ingestor.store().node(id(0xb2)).await.unwrap().unwrap();
    let info = node.info.expect("info blob");
    assert_eq!(info["long_name"], "Ridge Relay");
    assert_eq!(info["macaddr"], "01:02:03:04:05:06");
    assert_eq!(info["role"], "CLIENT");

    let (_, record) = &recorder.take()[0];
    assert_eq!(record.payload.as_ref(), Some(&info));
}

#[tokio::test]
async fn test_relay_node_is_published() {
    let (mut ingestor, recorder) = ingestor().await;

    let mut packet = mesh_packet(15, 0xb2, 0xffff_ffff, 3, 2);
    packet.relay_node = 0x5c;
    ingestor.process(&envelope("!000000a1", packet, None)).await.unwrap();

    let (_, record) = &recorder.take()[0];
    assert_eq!(record.port, "UNKNOWN");
    assert_eq!(record.payload, None);
    assert_eq!(record.hops[0].relay_node, Some(0x5c));
}

#[tokio::test]
async fn test_undecodable_envelope_leaves_no_state() {
    let (mut ingestor, recorder) = ingestor().await;

    ingestor.handle(b"definitely not protobuf").await.unwrap();
    let bad_gateway = envelope("gateway-one", mesh_packet(16, 0xb2, 0xffff_ffff, 3, 3), None);
    ingestor.handle(&bad_gateway).await.unwrap();

    assert_eq!(ingestor.stats().dropped, 2);
    assert!(ingestor.store().node(id(0xb2)).await.unwrap().is_none());
    assert!(recorder.take().is_empty());
}

#[tokio::test]
async fn test_nodes_since_by_gateway() {
    let (mut ingestor, _) = ingestor().await;
    let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

    ingestor.process_at(&text_from_b2("!000000a1", 3), t0).await.unwrap();
    let later = envelope("!000000a2", mesh_packet(20, 0xc3, 0xffff_ffff, 3, 3), None);
    ingestor
        .process_at(&later, t0 + Duration::minutes(30))
        .await
        .unwrap();

    let store = ingestor.store();
    let heard_by_a1 = store
        .nodes_since(t0 - Duration::minutes(1), Some(id(0xa1)))
        .await
        .unwrap();
    assert_eq!(heard_by_a1.iter().map(|n| n.id).collect::<Vec<_>>(), vec![id(0xb2)]);

    let recent = store.nodes_since(t0 + Duration::minutes(10), None).await.unwrap();
    let ids: Vec<_> = recent.iter().map(|n| n.id).collect();
    assert!(ids.contains(&id(0xc3)));
    assert!(ids.contains(&id(0xa2)));
    assert!(!ids.contains(&id(0xb2)));

    assert_eq!(
        store.gateway_ids_since(t0 - Duration::minutes(1)).await.unwrap(),
        vec![id(0xa1), id(0xa2)]
    );
}

#[cfg(feature = "crypto")]
#[tokio::test]
async fn test_default_key_payload_is_decrypted() {
    use meshscope_core::mesh::CryptoContext;

    let (mut ingestor, recorder) = ingestor().await;

    let plain = data(PortNum::TextMessageApp, b"encrypted hello".to_vec());
    let ciphertext = CryptoContext::with_default_psk().apply_keystream(
        &plain.encode_to_vec(),
        21,
        id(0xb2),
    );
    let mut packet = mesh_packet(21, 0xb2, 0xffff_ffff, 3, 2);
    packet.payload_variant = Some(PayloadVariant::Encrypted(ciphertext));
    let bytes = ServiceEnvelope {
        packet: Some(packet),
        channel_id: "LongFast".into(),
        gateway_id: "!000000a1".into(),
    }
    .encode_to_vec();

    ingestor.process(&bytes).await.unwrap();

    let (_, record) = &recorder.take()[0];
    assert_eq!(record.port, "TEXT_MESSAGE_APP");
    assert_eq!(record.payload, Some(json!({"message": "encrypted hello"})));

    let packet = ingestor
        .store()
        .packet(21, id(0xb2), NodeId::BROADCAST)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(packet.portnum, Some(1));
    assert_eq!(packet.length, 15);
}
