//! Meshtastic wire protocol as seen from an MQTT observer
//!
//! Gateways bridge radio traffic to a broker, one `ServiceEnvelope` per packet heard.
//! This module turns those envelopes into typed packets:
//!
//! - [`proto`]: hand-declared protobuf messages
//! - [`packet`]: node ids and the decoded packet view
//! - [`envelope`]: envelope parsing and opportunistic decryption
//! - [`crypto`]: AES-128-CTR with the default channel key
//! - [`payload`]: per-port payload interpretation
//! - [`traceroute`]: directed link reconstruction from traceroute records

pub mod crypto;
pub mod envelope;
pub mod packet;
pub mod payload;
pub mod proto;
pub mod traceroute;

pub use crypto::{ChannelKey, CryptoContext, CryptoError, DEFAULT_PSK};
pub use envelope::{decode_envelope, DecodedEnvelope, DecryptOutcome};
pub use packet::{NodeId, ObservedPacket, PacketBody, ParseNodeIdError};
pub use payload::{NeighborLink, NodeBlob, Payload};
pub use traceroute::{snr_from_quarter_db, PathDirection, RouteReport, TracedLink};
