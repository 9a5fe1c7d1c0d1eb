//! Application payload interpretation
//!
//! A decoded `Data` message carries a port number and an opaque body. [`Payload`] is the
//! closed set of port kinds this observer understands, plus an [`Payload::Opaque`]
//! passthrough for everything else. Each known kind renders to the JSON shape used for
//! persisted node blobs and published packet records.
//!
//! JSON rendering follows protobuf's canonical dictionary form with the original field
//! names: scalars at their default value are omitted, explicitly optional fields are
//! emitted when set, enums render by name and bytes as base64.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use prost::Message;
use serde_json::{json, Map, Value};
use tracing::warn;

use super::packet::NodeId;
use super::proto::{
    self, hardware_model_name, telemetry::Variant as TelemetryVariant, PortNum, Role,
};
use super::traceroute::RouteReport;

/// Interpreted payload of one packet
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// `TEXT_MESSAGE_APP`
    Text(String),
    /// `NODEINFO_APP`
    NodeInfo(proto::User),
    /// `POSITION_APP`
    Position(proto::Position),
    /// `TELEMETRY_APP`
    Telemetry(proto::Telemetry),
    /// `NEIGHBORINFO_APP`
    NeighborInfo(proto::NeighborInfo),
    /// `TRACEROUTE_APP` response
    Traceroute(proto::RouteDiscovery),
    /// Any other port, an empty traceroute request, or a body that failed to parse
    Opaque { portnum: i32, bytes: Vec<u8> },
}

/// Node attribute a payload replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeBlob {
    Info,
    Position,
    Metrics,
}

/// Neighbor-reported adjacency: `from` was heard by `to`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborLink {
    pub from: NodeId,
    pub to: NodeId,
    pub snr: f32,
}

impl Payload {
    /// Interpret a decoded `Data` message by its port number
    pub fn from_data(data: &proto::Data) -> Self {
        let opaque = || Payload::Opaque {
            portnum: data.portnum,
            bytes: data.payload.clone(),
        };
        let body = data.payload.as_slice();

        let parsed = match PortNum::try_from(data.portnum) {
            Ok(PortNum::TextMessageApp) => std::str::from_utf8(body)
                .map(|s| Payload::Text(s.to_string()))
                .map_err(|e| e.to_string()),
            Ok(PortNum::NodeinfoApp) => proto::User::decode(body)
                .map(Payload::NodeInfo)
                .map_err(|e| e.to_string()),
            Ok(PortNum::PositionApp) => proto::Position::decode(body)
                .map(Payload::Position)
                .map_err(|e| e.to_string()),
            Ok(PortNum::TelemetryApp) => proto::Telemetry::decode(body)
                .map(Payload::Telemetry)
                .map_err(|e| e.to_string()),
            Ok(PortNum::NeighborinfoApp) => proto::NeighborInfo::decode(body)
                .map(Payload::NeighborInfo)
                .map_err(|e| e.to_string()),
            // an empty body is a request still looking for its target
            Ok(PortNum::TracerouteApp) if body.is_empty() => Ok(opaque()),
            Ok(PortNum::TracerouteApp) => proto::RouteDiscovery::decode(body)
                .map(Payload::Traceroute)
                .map_err(|e| e.to_string()),
            _ => Ok(opaque()),
        };

        parsed.unwrap_or_else(|reason| {
            warn!(
                port = PortNum::name_of(data.portnum),
                len = body.len(),
                "payload does not parse for its port, passing through raw: {}",
                reason
            );
            opaque()
        })
    }

    /// Which node attribute this payload replaces, if any
    pub fn node_blob(&self) -> Option<NodeBlob> {
        match self {
            Payload::NodeInfo(_) => Some(NodeBlob::Info),
            Payload::Position(_) => Some(NodeBlob::Position),
            Payload::Telemetry(_) => Some(NodeBlob::Metrics),
            Payload::Text(_)
            | Payload::NeighborInfo(_)
            | Payload::Traceroute(_)
            | Payload::Opaque { .. } => None,
        }
    }

    /// Adjacencies reported by `reporter` in a neighbor-list broadcast
    pub fn neighbor_links(&self, reporter: NodeId) -> Vec<NeighborLink> {
        match self {
            Payload::NeighborInfo(info) => info
                .neighbors
                .iter()
                .map(|n| NeighborLink {
                    from: NodeId::from_u32(n.node_id),
                    to: reporter,
                    snr: n.snr,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Traceroute record in the context of the packet carrying it
    pub fn route_report(&self, packet_from: NodeId, packet_to: NodeId) -> Option<RouteReport> {
        match self {
            Payload::Traceroute(route) => Some(RouteReport::new(route, packet_from, packet_to)),
            _ => None,
        }
    }

    /// Render to the JSON shape stored on nodes and published with packets
    pub fn to_json(&self) -> Value {
        match self {
            Payload::Text(message) => json!({ "message": message }),
            Payload::NodeInfo(user) => user_json(user),
            Payload::Position(position) => position_json(position),
            Payload::Telemetry(telemetry) => telemetry_json(telemetry),
            Payload::NeighborInfo(info) => neighbor_info_json(info),
            Payload::Traceroute(route) => route_json(route),
            Payload::Opaque { bytes, .. } => Value::String(hex_spaced(bytes)),
        }
    }
}

/// Lower-case hex with a space between bytes
pub fn hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Object builder that skips proto3 default values
#[derive(Default)]
struct Fields(Map<String, Value>);

impl Fields {
    fn put(&mut self, name: &str, value: Value) -> &mut Self {
        self.0.insert(name.to_string(), value);
        self
    }

    fn uint(&mut self, name: &str, value: u32) -> &mut Self {
        if value != 0 {
            self.put(name, json!(value));
        }
        self
    }

    fn int(&mut self, name: &str, value: i32) -> &mut Self {
        if value != 0 {
            self.put(name, json!(value));
        }
        self
    }

    fn float(&mut self, name: &str, value: f32) -> &mut Self {
        if value != 0.0 {
            self.put(name, float_value(value));
        }
        self
    }

    fn flag(&mut self, name: &str, value: bool) -> &mut Self {
        if value {
            self.put(name, Value::Bool(true));
        }
        self
    }

    fn string(&mut self, name: &str, value: &str) -> &mut Self {
        if !value.is_empty() {
            self.put(name, Value::String(value.to_string()));
        }
        self
    }

    fn bytes(&mut self, name: &str, value: &[u8]) -> &mut Self {
        if !value.is_empty() {
            self.put(name, Value::String(BASE64.encode(value)));
        }
        self
    }

    fn opt<T: Into<Value>>(&mut self, name: &str, value: Option<T>) -> &mut Self {
        if let Some(v) = value {
            self.put(name, v.into());
        }
        self
    }

    fn opt_float(&mut self, name: &str, value: Option<f32>) -> &mut Self {
        if let Some(v) = value {
            self.put(name, float_value(v));
        }
        self
    }

    fn list<T: Into<Value> + Copy>(&mut self, name: &str, values: &[T]) -> &mut Self {
        if !values.is_empty() {
            let items = values.iter().map(|v| (*v).into()).collect();
            self.put(name, Value::Array(items));
        }
        self
    }

    fn build(&mut self) -> Value {
        Value::Object(std::mem::take(&mut self.0))
    }
}

/// Shortest decimal form of an `f32`, so 0.1 renders as `0.1` rather than its f64 widening
fn float_value(value: f32) -> Value {
    if value.is_nan() {
        return Value::String("NaN".into());
    }
    if value.is_infinite() {
        let name = if value > 0.0 { "Infinity" } else { "-Infinity" };
        return Value::String(name.into());
    }
    let shortest: f64 = value.to_string().parse().unwrap_or(f64::from(value));
    serde_json::Number::from_f64(shortest)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn enum_value(name: Option<&'static str>, raw: i32) -> Value {
    name.map(|n| Value::String(n.into()))
        .unwrap_or_else(|| json!(raw))
}

fn user_json(user: &proto::User) -> Value {
    let mut fields = Fields::default();
    fields
        .string("id", &user.id)
        .string("long_name", &user.long_name)
        .string("short_name", &user.short_name);

    if !user.macaddr.is_empty() {
        let mac = user
            .macaddr
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":");
        fields.put("macaddr", Value::String(mac));
    }
    if user.hw_model != 0 {
        fields.put(
            "hw_model",
            enum_value(hardware_model_name(user.hw_model), user.hw_model),
        );
    }

    let role = Role::try_from(user.role).map(|r| r.as_str_name()).ok();
    fields
        .flag("is_licensed", user.is_licensed)
        .put("role", enum_value(role, user.role))
        .bytes("public_key", &user.public_key)
        .opt("is_unmessagable", user.is_unmessagable)
        .build()
}

fn location_source_name(value: i32) -> Option<&'static str> {
    ["LOC_UNSET", "LOC_MANUAL", "LOC_INTERNAL", "LOC_EXTERNAL"]
        .get(usize::try_from(value).ok()?)
        .copied()
}

fn altitude_source_name(value: i32) -> Option<&'static str> {
    [
        "ALT_UNSET",
        "ALT_MANUAL",
        "ALT_INTERNAL",
        "ALT_EXTERNAL",
        "ALT_BAROMETRIC",
    ]
    .get(usize::try_from(value).ok()?)
    .copied()
}

fn position_json(p: &proto::Position) -> Value {
    let mut fields = Fields::default();
    fields
        .opt("latitude_i", p.latitude_i)
        .opt("longitude_i", p.longitude_i)
        .opt("altitude", p.altitude)
        .uint("time", p.time);
    if p.location_source != 0 {
        fields.put(
            "location_source",
            enum_value(location_source_name(p.location_source), p.location_source),
        );
    }
    if p.altitude_source != 0 {
        fields.put(
            "altitude_source",
            enum_value(altitude_source_name(p.altitude_source), p.altitude_source),
        );
    }
    fields
        .uint("timestamp", p.timestamp)
        .int("timestamp_millis_adjust", p.timestamp_millis_adjust)
        .opt("altitude_hae", p.altitude_hae)
        .opt("altitude_geoidal_separation", p.altitude_geoidal_separation)
        .uint("PDOP", p.pdop)
        .uint("HDOP", p.hdop)
        .uint("VDOP", p.vdop)
        .uint("gps_accuracy", p.gps_accuracy)
        .opt("ground_speed", p.ground_speed)
        .opt("ground_track", p.ground_track)
        .uint("fix_quality", p.fix_quality)
        .uint("fix_type", p.fix_type)
        .uint("sats_in_view", p.sats_in_view)
        .uint("sensor_id", p.sensor_id)
        .uint("next_update", p.next_update)
        .uint("seq_number", p.seq_number)
        .uint("precision_bits", p.precision_bits)
        .opt("latitude", p.latitude_i.map(|v| f64::from(v) * 1e-7))
        .opt("longitude", p.longitude_i.map(|v| f64::from(v) * 1e-7))
        .build()
}

fn telemetry_json(t: &proto::Telemetry) -> Value {
    let mut fields = Fields::default();
    fields.uint("time", t.time);

    match &t.variant {
        Some(TelemetryVariant::DeviceMetrics(m)) => {
            let mut metrics = Fields::default();
            metrics
                .opt("battery_level", m.battery_level)
                .opt_float("voltage", m.voltage)
                .opt_float("channel_utilization", m.channel_utilization)
                .opt_float("air_util_tx", m.air_util_tx)
                .opt("uptime_seconds", m.uptime_seconds);
            if m.channel_utilization.is_none() {
                metrics.put("channel_utilization", json!(0));
            }
            if m.air_util_tx.is_none() {
                metrics.put("air_util_tx", json!(0));
            }
            fields.put("device_metrics", metrics.build());
        }
        Some(TelemetryVariant::EnvironmentMetrics(m)) => {
            let value = Fields::default()
                .opt_float("temperature", m.temperature)
                .opt_float("relative_humidity", m.relative_humidity)
                .opt_float("barometric_pressure", m.barometric_pressure)
                .opt_float("gas_resistance", m.gas_resistance)
                .opt_float("voltage", m.voltage)
                .opt_float("current", m.current)
                .opt("iaq", m.iaq)
                .opt_float("distance", m.distance)
                .opt_float("lux", m.lux)
                .opt_float("white_lux", m.white_lux)
                .opt_float("ir_lux", m.ir_lux)
                .opt_float("uv_lux", m.uv_lux)
                .opt("wind_direction", m.wind_direction)
                .opt_float("wind_speed", m.wind_speed)
                .opt_float("weight", m.weight)
                .opt_float("wind_gust", m.wind_gust)
                .opt_float("wind_lull", m.wind_lull)
                .build();
            fields.put("environment_metrics", value);
        }
        Some(TelemetryVariant::PowerMetrics(m)) => {
            let value = Fields::default()
                .opt_float("ch1_voltage", m.ch1_voltage)
                .opt_float("ch1_current", m.ch1_current)
                .opt_float("ch2_voltage", m.ch2_voltage)
                .opt_float("ch2_current", m.ch2_current)
                .opt_float("ch3_voltage", m.ch3_voltage)
                .opt_float("ch3_current", m.ch3_current)
                .build();
            fields.put("power_metrics", value);
        }
        Some(TelemetryVariant::LocalStats(s)) => {
            let value = Fields::default()
                .uint("uptime_seconds", s.uptime_seconds)
                .float("channel_utilization", s.channel_utilization)
                .float("air_util_tx", s.air_util_tx)
                .uint("num_packets_tx", s.num_packets_tx)
                .uint("num_packets_rx", s.num_packets_rx)
                .uint("num_packets_rx_bad", s.num_packets_rx_bad)
                .uint("num_online_nodes", s.num_online_nodes)
                .uint("num_total_nodes", s.num_total_nodes)
                .uint("num_rx_dupe", s.num_rx_dupe)
                .uint("num_tx_relay", s.num_tx_relay)
                .uint("num_tx_relay_canceled", s.num_tx_relay_canceled)
                .build();
            fields.put("local_stats", value);
        }
        None => {}
    }
    fields.build()
}

fn neighbor_info_json(info: &proto::NeighborInfo) -> Value {
    let neighbors: Vec<Value> = info
        .neighbors
        .iter()
        .map(|n| {
            Fields::default()
                .uint("node_id", n.node_id)
                .float("snr", n.snr)
                .uint("last_rx_time", n.last_rx_time)
                .uint("node_broadcast_interval_secs", n.node_broadcast_interval_secs)
                .build()
        })
        .collect();

    let mut fields = Fields::default();
    fields
        .uint("node_id", info.node_id)
        .uint("last_sent_by_id", info.last_sent_by_id)
        .uint("node_broadcast_interval_secs", info.node_broadcast_interval_secs);
    if !neighbors.is_empty() {
        fields.put("neighbors", Value::Array(neighbors));
    }
    fields.build()
}

fn route_json(route: &proto::RouteDiscovery) -> Value {
    Fields::default()
        .list("route", &route.route)
        .list("snr_towards", &route.snr_towards)
        .list("route_back", &route.route_back)
        .list("snr_back", &route.snr_back)
        .build()
}
