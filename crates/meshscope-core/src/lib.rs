//! # meshscope-core
//!
//! Passive collector for Meshtastic mesh networks that uplink to MQTT.
//!
//! Gateways publish every packet they hear to a broker. This crate subscribes to that
//! feed, decodes and (where the default channel key applies) decrypts each packet,
//! interprets its payload, and maintains a topology database: which nodes exist, which
//! gateways hear them, and which directed radio links can be inferred from zero-hop
//! receptions, neighbor broadcasts and traceroutes. Every processed message is then
//! handed to a [`publish::PacketPublisher`] for real-time fan-out.
//!
//! ## Pipeline
//!
//! ```text
//! MqttListener -> decode_envelope -> decrypt -> Payload -> StoreTx (commit) -> publish
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshscope_core::{BroadcastPublisher, Ingestor, ListenerConfig, MqttListener, Store};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> meshscope_core::Result<()> {
//! let store = Store::open("data/nodes.db").await?;
//! let mut ingestor = Ingestor::new(store, BroadcastPublisher::new(256));
//! let listener = MqttListener::new(ListenerConfig::default());
//! listener.run(&mut ingestor, CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod ingest;
pub mod listener;
pub mod mesh;
pub mod publish;
pub mod store;

pub use error::{IngestError, Result};
pub use ingest::{IngestStats, Ingestor};
pub use listener::{ListenerConfig, MqttListener};
pub use mesh::NodeId;
pub use publish::{BroadcastPublisher, HopRecord, PacketPublisher, PacketRecord, PublishedPacket};
pub use store::{LinkSource, Store, StoreTx};
