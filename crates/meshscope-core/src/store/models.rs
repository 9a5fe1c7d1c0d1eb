//! Row types of the topology store

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::fmt;
use std::str::FromStr;

use crate::mesh::NodeId;

/// How a direct link was inferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkSource {
    /// Gateway heard the sender at zero hops
    Gateway,
    /// Derived from a traceroute record
    Traceroute,
    /// Reported in a neighbor-list broadcast
    NeighborInfo,
}

impl LinkSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkSource::Gateway => "gateway",
            LinkSource::Traceroute => "traceroute",
            LinkSource::NeighborInfo => "neighborinfo",
        }
    }
}

impl fmt::Display for LinkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gateway" => Ok(LinkSource::Gateway),
            "traceroute" => Ok(LinkSource::Traceroute),
            "neighborinfo" => Ok(LinkSource::NeighborInfo),
            other => Err(format!("unknown link source {:?}", other)),
        }
    }
}

/// A mesh participant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Hop start of the last packet sent; `None` for placeholders
    pub hop_limit: Option<u32>,
    /// Gateway observations of packets from this node
    pub message_count: i64,
    pub legacy: bool,
    pub info: Option<Value>,
    pub position: Option<Value>,
    pub metrics: Option<Value>,
}

impl Node {
    /// Created only as a link endpoint, never heard as a sender
    pub fn is_placeholder(&self) -> bool {
        self.hop_limit.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Gateway {
    pub id: NodeId,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A gateway has heard a node
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayNodeLink {
    pub gateway_id: NodeId,
    pub node_id: NodeId,
    pub last_seen: DateTime<Utc>,
    /// Only set from zero-hop receptions
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
}

/// A logical mesh packet keyed by `(id, from, to)`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Packet {
    pub id: u32,
    pub from_id: NodeId,
    pub to_id: NodeId,
    pub first_seen: DateTime<Utc>,
    /// Payload length, -1 if never decoded
    pub length: i64,
    pub hop_start: u32,
    pub portnum: Option<i32>,
}

/// One gateway's observation of a packet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketGatewayLink {
    pub packet_id: u32,
    pub from_id: NodeId,
    pub to_id: NodeId,
    pub gateway_id: NodeId,
    pub relay_node: Option<u32>,
    pub seen_at: DateTime<Utc>,
    pub hop_limit: u32,
    pub rssi: i32,
    pub snr: f32,
}

/// Directed radio adjacency `from -> to`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectLink {
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub last_seen: DateTime<Utc>,
    pub last_snr: Option<f32>,
    pub last_rssi: Option<i32>,
    pub source: LinkSource,
    pub observation_count: i64,
}

fn node_id(row: &SqliteRow, column: &str) -> Result<NodeId, sqlx::Error> {
    row.try_get::<u32, _>(column).map(NodeId::from_u32)
}

fn json_column(row: &SqliteRow, column: &str) -> Result<Option<Value>, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|e| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        })
    })
    .transpose()
}

impl<'r> FromRow<'r, SqliteRow> for Node {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: node_id(row, "id")?,
            first_seen: row.try_get("first_seen")?,
            last_seen: row.try_get("last_seen")?,
            hop_limit: row.try_get("hop_limit")?,
            message_count: row.try_get("message_count")?,
            legacy: row.try_get("legacy")?,
            info: json_column(row, "info")?,
            position: json_column(row, "position")?,
            metrics: json_column(row, "metrics")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for Gateway {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: node_id(row, "id")?,
            first_seen: row.try_get("first_seen")?,
            last_seen: row.try_get("last_seen")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for GatewayNodeLink {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            gateway_id: node_id(row, "gateway_id")?,
            node_id: node_id(row, "node_id")?,
            last_seen: row.try_get("last_seen")?,
            rssi: row.try_get("rssi")?,
            snr: row.try_get("snr")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for Packet {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            from_id: node_id(row, "from_id")?,
            to_id: node_id(row, "to_id")?,
            first_seen: row.try_get("first_seen")?,
            length: row.try_get("length")?,
            hop_start: row.try_get("hop_start")?,
            portnum: row.try_get("portnum")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for PacketGatewayLink {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            packet_id: row.try_get("packet_id")?,
            from_id: node_id(row, "from_id")?,
            to_id: node_id(row, "to_id")?,
            gateway_id: node_id(row, "gateway_id")?,
            relay_node: row.try_get("relay_node")?,
            seen_at: row.try_get("seen_at")?,
            hop_limit: row.try_get("hop_limit")?,
            rssi: row.try_get("rssi")?,
            snr: row.try_get("snr")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for DirectLink {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let source: String = row.try_get("source")?;
        Ok(Self {
            from_node_id: node_id(row, "from_node_id")?,
            to_node_id: node_id(row, "to_node_id")?,
            last_seen: row.try_get("last_seen")?,
            last_snr: row.try_get("last_snr")?,
            last_rssi: row.try_get("last_rssi")?,
            source: source.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
                index: "source".into(),
                source: e.into(),
            })?,
            observation_count: row.try_get("observation_count")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_source_names() {
        for source in [
            LinkSource::Gateway,
            LinkSource::Traceroute,
            LinkSource::NeighborInfo,
        ] {
            assert_eq!(source.as_str().parse::<LinkSource>(), Ok(source));
        }
        assert!("radio".parse::<LinkSource>().is_err());
        assert_eq!(
            serde_json::to_value(LinkSource::NeighborInfo).unwrap(),
            "neighborinfo"
        );
    }
}
