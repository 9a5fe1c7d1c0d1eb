//! Topology store
//!
//! SQLite-backed graph of nodes, gateways and the links between them, plus every packet
//! and each gateway's observation of it. All mutations for one inbound message go through
//! a [`StoreTx`]: it commits explicitly and rolls back when dropped, so an error anywhere
//! in the pipeline leaves nothing half-applied.
//!
//! The database runs in WAL mode, so query collaborators reading through [`Store`] see
//! the last committed message and never a message in flight.

pub mod models;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Executor, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::mesh::{NodeBlob, NodeId};
pub use models::{DirectLink, Gateway, GatewayNodeLink, LinkSource, Node, Packet, PacketGatewayLink};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY NOT NULL,
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        hop_limit INTEGER,
        message_count INTEGER NOT NULL DEFAULT 0,
        legacy BOOLEAN NOT NULL DEFAULT 0,
        position TEXT,
        metrics TEXT,
        info TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gateways (
        id INTEGER PRIMARY KEY NOT NULL,
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gateway_node_links (
        gateway_id INTEGER NOT NULL REFERENCES gateways(id),
        node_id INTEGER NOT NULL REFERENCES nodes(id),
        last_seen TEXT NOT NULL,
        rssi INTEGER,
        snr REAL,
        PRIMARY KEY (gateway_id, node_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS packets (
        id INTEGER NOT NULL,
        from_id INTEGER NOT NULL,
        to_id INTEGER NOT NULL,
        first_seen TEXT NOT NULL,
        length INTEGER NOT NULL,
        hop_start INTEGER NOT NULL,
        portnum INTEGER,
        PRIMARY KEY (id, from_id, to_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS packet_gateway_links (
        packet_id INTEGER NOT NULL,
        from_id INTEGER NOT NULL,
        to_id INTEGER NOT NULL,
        gateway_id INTEGER NOT NULL REFERENCES gateways(id),
        relay_node INTEGER,
        seen_at TEXT NOT NULL,
        hop_limit INTEGER NOT NULL,
        rssi INTEGER NOT NULL,
        snr REAL NOT NULL,
        PRIMARY KEY (packet_id, from_id, to_id, gateway_id),
        FOREIGN KEY (packet_id, from_id, to_id) REFERENCES packets(id, from_id, to_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS direct_links (
        from_node_id INTEGER NOT NULL REFERENCES nodes(id),
        to_node_id INTEGER NOT NULL REFERENCES nodes(id),
        last_seen TEXT NOT NULL,
        last_snr REAL,
        last_rssi INTEGER,
        source TEXT NOT NULL CHECK (source IN ('gateway', 'traceroute', 'neighborinfo')),
        observation_count INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (from_node_id, to_node_id),
        CHECK (from_node_id <> to_node_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_nodes_last_seen ON nodes(last_seen)",
    "CREATE INDEX IF NOT EXISTS idx_gateways_last_seen ON gateways(last_seen)",
    "CREATE INDEX IF NOT EXISTS idx_packets_first_seen ON packets(first_seen)",
    "CREATE INDEX IF NOT EXISTS idx_packets_portnum ON packets(portnum)",
    "CREATE INDEX IF NOT EXISTS idx_pgl_seen_at ON packet_gateway_links(seen_at)",
    "CREATE INDEX IF NOT EXISTS idx_direct_links_last_seen ON direct_links(last_seen)",
];

const NODE_COLUMNS: &str =
    "n.id, n.first_seen, n.last_seen, n.hop_limit, n.message_count, n.legacy, n.info, n.position, n.metrics";

/// Handle to the topology database
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database file at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), "topology store opened");
        Ok(store)
    }

    /// Private in-memory database, for tests and offline tooling
    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // every connection to :memory: is its own database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("topology schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start the transaction for one inbound message
    pub async fn begin(&self) -> Result<StoreTx> {
        Ok(StoreTx {
            tx: self.pool.begin().await?,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn node(&self, id: NodeId) -> Result<Option<Node>> {
        fetch_node(&self.pool, id).await
    }

    /// Nodes seen since `since`; with a gateway, only nodes that gateway heard since then
    pub async fn nodes_since(
        &self,
        since: DateTime<Utc>,
        gateway: Option<NodeId>,
    ) -> Result<Vec<Node>> {
        let nodes = match gateway {
            None => {
                let sql = format!(
                    "SELECT {NODE_COLUMNS} FROM nodes n WHERE n.last_seen >= ? ORDER BY n.last_seen DESC"
                );
                sqlx::query_as::<_, Node>(&sql)
                    .bind(since)
                    .fetch_all(&self.pool)
                    .await?
            }
            Some(gateway) => {
                let sql = format!(
                    "SELECT {NODE_COLUMNS} FROM nodes n \
                     JOIN gateway_node_links g ON g.node_id = n.id \
                     WHERE g.gateway_id = ? AND g.last_seen >= ? \
                     ORDER BY n.last_seen DESC"
                );
                sqlx::query_as::<_, Node>(&sql)
                    .bind(gateway.to_i64())
                    .bind(since)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(nodes)
    }

    pub async fn gateway(&self, id: NodeId) -> Result<Option<Gateway>> {
        let gateway = sqlx::query_as::<_, Gateway>("SELECT * FROM gateways WHERE id = ?")
            .bind(id.to_i64())
            .fetch_optional(&self.pool)
            .await?;
        Ok(gateway)
    }

    pub async fn gateway_ids_since(&self, since: DateTime<Utc>) -> Result<Vec<NodeId>> {
        let ids: Vec<u32> =
            sqlx::query_scalar("SELECT id FROM gateways WHERE last_seen >= ? ORDER BY id")
                .bind(since)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(NodeId::from_u32).collect())
    }

    /// Gateways that have heard `node`
    pub async fn gateway_links(&self, node: NodeId) -> Result<Vec<GatewayNodeLink>> {
        let links = sqlx::query_as::<_, GatewayNodeLink>(
            "SELECT * FROM gateway_node_links WHERE node_id = ? ORDER BY last_seen DESC",
        )
        .bind(node.to_i64())
        .fetch_all(&self.pool)
        .await?;
        Ok(links)
    }

    pub async fn direct_link(&self, from: NodeId, to: NodeId) -> Result<Option<DirectLink>> {
        let link = sqlx::query_as::<_, DirectLink>(
            "SELECT * FROM direct_links WHERE from_node_id = ? AND to_node_id = ?",
        )
        .bind(from.to_i64())
        .bind(to.to_i64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(link)
    }

    pub async fn direct_links_since(&self, since: DateTime<Utc>) -> Result<Vec<DirectLink>> {
        let links = sqlx::query_as::<_, DirectLink>(
            "SELECT * FROM direct_links WHERE last_seen >= ? ORDER BY last_seen DESC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(links)
    }

    /// Links into or out of `node` seen since `since`
    pub async fn links_for_node(
        &self,
        node: NodeId,
        since: DateTime<Utc>,
    ) -> Result<Vec<DirectLink>> {
        let links = sqlx::query_as::<_, DirectLink>(
            "SELECT * FROM direct_links \
             WHERE (from_node_id = ? OR to_node_id = ?) AND last_seen >= ? \
             ORDER BY last_seen DESC",
        )
        .bind(node.to_i64())
        .bind(node.to_i64())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(links)
    }

    pub async fn packet(&self, id: u32, from: NodeId, to: NodeId) -> Result<Option<Packet>> {
        let packet = sqlx::query_as::<_, Packet>(
            "SELECT * FROM packets WHERE id = ? AND from_id = ? AND to_id = ?",
        )
        .bind(id)
        .bind(from.to_i64())
        .bind(to.to_i64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(packet)
    }

    /// Packets first seen in `[start, end)`, optionally restricted to one port
    pub async fn packets_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        portnum: Option<i32>,
    ) -> Result<Vec<Packet>> {
        let packets = sqlx::query_as::<_, Packet>(
            "SELECT * FROM packets \
             WHERE first_seen >= ? AND first_seen < ? AND (? IS NULL OR portnum = ?) \
             ORDER BY first_seen",
        )
        .bind(start)
        .bind(end)
        .bind(portnum)
        .bind(portnum)
        .fetch_all(&self.pool)
        .await?;
        Ok(packets)
    }

    pub async fn packet_hops(
        &self,
        id: u32,
        from: NodeId,
        to: NodeId,
    ) -> Result<Vec<PacketGatewayLink>> {
        fetch_hops(&self.pool, id, from, to).await
    }
}

/// Everything the packet/observation insert needs
#[derive(Debug, Clone, PartialEq)]
pub struct PacketObservation {
    pub packet_id: u32,
    pub from: NodeId,
    pub to: NodeId,
    pub gateway: NodeId,
    pub relay_node: Option<u32>,
    /// Payload length, -1 if not decoded
    pub length: i64,
    pub hop_start: u32,
    pub hop_limit: u32,
    pub portnum: Option<i32>,
    pub rssi: i32,
    pub snr: f32,
    pub seen_at: DateTime<Utc>,
}

/// Result of recording one gateway's observation of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First observation of this packet by this gateway
    New,
    /// This gateway already reported this packet
    Duplicate,
}

/// Scoped write transaction for one inbound message
///
/// Dropping without [`StoreTx::commit`] rolls every change back.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    pub async fn upsert_gateway(&mut self, id: NodeId, seen_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO gateways (id, first_seen, last_seen) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET last_seen = excluded.last_seen",
        )
        .bind(id.to_i64())
        .bind(seen_at)
        .bind(seen_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Record that `id` sent a packet
    ///
    /// `hop_start` becomes the node's hop limit. The legacy flag takes the observed
    /// value the first time the node is heard as a sender and can only be cleared
    /// afterwards.
    pub async fn upsert_node(
        &mut self,
        id: NodeId,
        seen_at: DateTime<Utc>,
        hop_start: u32,
        legacy: bool,
    ) -> Result<()> {
        let existing: Option<(Option<u32>, bool)> =
            sqlx::query_as("SELECT hop_limit, legacy FROM nodes WHERE id = ?")
                .bind(id.to_i64())
                .fetch_optional(&mut *self.tx)
                .await?;

        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO nodes (id, first_seen, last_seen, hop_limit, message_count, legacy) \
                     VALUES (?, ?, ?, ?, 0, ?)",
                )
                .bind(id.to_i64())
                .bind(seen_at)
                .bind(seen_at)
                .bind(hop_start)
                .bind(legacy)
                .execute(&mut *self.tx)
                .await?;
                debug!(node = %id, legacy, "new node");
            }
            Some((hop_limit, was_legacy)) => {
                let legacy = match hop_limit {
                    // placeholder heard as a sender for the first time
                    None => legacy,
                    Some(_) => was_legacy && legacy,
                };
                sqlx::query("UPDATE nodes SET last_seen = ?, hop_limit = ?, legacy = ? WHERE id = ?")
                    .bind(seen_at)
                    .bind(hop_start)
                    .bind(legacy)
                    .bind(id.to_i64())
                    .execute(&mut *self.tx)
                    .await?;
            }
        }
        Ok(())
    }

    /// Mark that `gateway` heard `node`
    pub async fn touch_gateway_node(
        &mut self,
        gateway: NodeId,
        node: NodeId,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO gateway_node_links (gateway_id, node_id, last_seen) VALUES (?, ?, ?) \
             ON CONFLICT(gateway_id, node_id) DO UPDATE SET last_seen = excluded.last_seen",
        )
        .bind(gateway.to_i64())
        .bind(node.to_i64())
        .bind(seen_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Store the signal of a zero-hop reception on the gateway/node association
    pub async fn update_gateway_node_rx(
        &mut self,
        gateway: NodeId,
        node: NodeId,
        rssi: i32,
        snr: f32,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE gateway_node_links SET rssi = ?, snr = ?, last_seen = ? \
             WHERE gateway_id = ? AND node_id = ?",
        )
        .bind(rssi)
        .bind(snr)
        .bind(seen_at)
        .bind(gateway.to_i64())
        .bind(node.to_i64())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Replace one of the node's structured blobs
    pub async fn set_node_blob(
        &mut self,
        id: NodeId,
        blob: NodeBlob,
        value: &serde_json::Value,
    ) -> Result<()> {
        let column = match blob {
            NodeBlob::Info => "info",
            NodeBlob::Position => "position",
            NodeBlob::Metrics => "metrics",
        };
        let sql = format!("UPDATE nodes SET {column} = ? WHERE id = ?");
        sqlx::query(&sql)
            .bind(serde_json::to_string(value)?)
            .bind(id.to_i64())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Create a placeholder node if `id` is unknown; returns whether one was created
    pub async fn ensure_node(&mut self, id: NodeId, seen_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO nodes (id, first_seen, last_seen, message_count, legacy) \
             VALUES (?, ?, ?, 0, 0)",
        )
        .bind(id.to_i64())
        .bind(seen_at)
        .bind(seen_at)
        .execute(&mut *self.tx)
        .await?;

        let created = result.rows_affected() == 1;
        if created {
            info!(node = %id, "created placeholder node");
        }
        Ok(created)
    }

    /// Insert or refresh the directed link `from -> to`
    ///
    /// Self-links are ignored and `false` is returned. Missing endpoints become
    /// placeholder nodes.
    pub async fn upsert_direct_link(
        &mut self,
        from: NodeId,
        to: NodeId,
        seen_at: DateTime<Utc>,
        snr: Option<f32>,
        rssi: Option<i32>,
        source: LinkSource,
    ) -> Result<bool> {
        if from == to {
            debug!(node = %from, %source, "ignoring self-link");
            return Ok(false);
        }

        self.ensure_node(from, seen_at).await?;
        self.ensure_node(to, seen_at).await?;

        sqlx::query(
            "INSERT INTO direct_links \
             (from_node_id, to_node_id, last_seen, last_snr, last_rssi, source, observation_count) \
             VALUES (?, ?, ?, ?, ?, ?, 1) \
             ON CONFLICT(from_node_id, to_node_id) DO UPDATE SET \
             last_seen = excluded.last_seen, \
             last_snr = excluded.last_snr, \
             last_rssi = excluded.last_rssi, \
             source = excluded.source, \
             observation_count = direct_links.observation_count + 1",
        )
        .bind(from.to_i64())
        .bind(to.to_i64())
        .bind(seen_at)
        .bind(snr)
        .bind(rssi)
        .bind(source.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(true)
    }

    /// Whether `gateway` already reported this packet
    pub async fn has_observation(
        &mut self,
        packet_id: u32,
        from: NodeId,
        to: NodeId,
        gateway: NodeId,
    ) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM packet_gateway_links \
             WHERE packet_id = ? AND from_id = ? AND to_id = ? AND gateway_id = ?",
        )
        .bind(packet_id)
        .bind(from.to_i64())
        .bind(to.to_i64())
        .bind(gateway.to_i64())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(found.is_some())
    }

    /// Insert the packet if new and this gateway's observation of it
    ///
    /// A repeated observation by the same gateway changes nothing. A new one bumps the
    /// sender's message count.
    pub async fn record_packet(&mut self, obs: &PacketObservation) -> Result<RecordOutcome> {
        sqlx::query(
            "INSERT OR IGNORE INTO packets (id, from_id, to_id, first_seen, length, hop_start, portnum) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(obs.packet_id)
        .bind(obs.from.to_i64())
        .bind(obs.to.to_i64())
        .bind(obs.seen_at)
        .bind(obs.length)
        .bind(obs.hop_start)
        .bind(obs.portnum)
        .execute(&mut *self.tx)
        .await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO packet_gateway_links \
             (packet_id, from_id, to_id, gateway_id, relay_node, seen_at, hop_limit, rssi, snr) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(obs.packet_id)
        .bind(obs.from.to_i64())
        .bind(obs.to.to_i64())
        .bind(obs.gateway.to_i64())
        .bind(obs.relay_node)
        .bind(obs.seen_at)
        .bind(obs.hop_limit)
        .bind(obs.rssi)
        .bind(obs.snr)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            warn!(
                packet_id = format_args!("{:08x}", obs.packet_id),
                gateway = %obs.gateway,
                from = %obs.from,
                "duplicate packet received"
            );
            return Ok(RecordOutcome::Duplicate);
        }

        sqlx::query("UPDATE nodes SET message_count = message_count + 1 WHERE id = ?")
            .bind(obs.from.to_i64())
            .execute(&mut *self.tx)
            .await?;
        Ok(RecordOutcome::New)
    }

    pub async fn node(&mut self, id: NodeId) -> Result<Option<Node>> {
        fetch_node(&mut *self.tx, id).await
    }

    pub async fn packet_hops(
        &mut self,
        id: u32,
        from: NodeId,
        to: NodeId,
    ) -> Result<Vec<PacketGatewayLink>> {
        fetch_hops(&mut *self.tx, id, from, to).await
    }
}

async fn fetch_node<'e, E>(executor: E, id: NodeId) -> Result<Option<Node>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
        .bind(id.to_i64())
        .fetch_optional(executor)
        .await?;
    Ok(node)
}

/// Observations of a packet, closest to the destination first
async fn fetch_hops<'e, E>(
    executor: E,
    id: u32,
    from: NodeId,
    to: NodeId,
) -> Result<Vec<PacketGatewayLink>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let hops = sqlx::query_as::<_, PacketGatewayLink>(
        "SELECT * FROM packet_gateway_links \
         WHERE packet_id = ? AND from_id = ? AND to_id = ? \
         ORDER BY hop_limit ASC, seen_at ASC",
    )
    .bind(id)
    .bind(from.to_i64())
    .bind(to.to_i64())
    .fetch_all(executor)
    .await?;
    Ok(hops)
}
