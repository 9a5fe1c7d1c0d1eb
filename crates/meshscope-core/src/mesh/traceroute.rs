//! Mesh Traceroute reconstruction
//!
//! A Meshtastic traceroute response lists the nodes a request passed through and the
//! SNR each hop measured when receiving it. From one record we can recover a chain of
//! directed radio links with per-link signal quality.
//!
//! ## Record layout
//!
//! ```text
//! towards:  I ──snr[0]──▶ route[0] ──snr[1]──▶ ... route[n-1] ──snr[n]──▶ T
//! back:     T ──snr[0]──▶ back[0]  ──snr[1]──▶ ... back[m-1]  ──snr[m]──▶ I
//! ```
//!
//! While the request is still travelling only `snr_towards` is filled and the packet
//! goes from the initiator to the target. Once the target answers, the reply goes from
//! the target back to the initiator and carries `snr_back`, so the packet's sender is
//! the target.
//!
//! SNR values are quarter-dB integers; [`SNR_UNKNOWN`] means the hop did not measure.

use std::fmt;

use tracing::warn;

use super::packet::NodeId;
use super::proto::RouteDiscovery;

/// Quarter-dB SNR sentinel for "not measured" (`INT8_MIN`)
pub const SNR_UNKNOWN: i32 = -128;

/// Convert a quarter-dB SNR to dB, mapping the sentinel to `None`
pub fn snr_from_quarter_db(raw: i32) -> Option<f32> {
    if raw == SNR_UNKNOWN {
        None
    } else {
        Some(raw as f32 / 4.0)
    }
}

/// Which half of the round trip a link was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathDirection {
    /// Initiator towards target
    Towards,
    /// Target back to initiator
    Back,
}

impl fmt::Display for PathDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathDirection::Towards => write!(f, "towards"),
            PathDirection::Back => write!(f, "back"),
        }
    }
}

/// A single directed link recovered from a traceroute
#[derive(Debug, Clone, PartialEq)]
pub struct TracedLink {
    /// Transmitting node
    pub from: NodeId,
    /// Receiving node
    pub to: NodeId,
    /// SNR measured by `to`, in dB
    pub snr: Option<f32>,
    pub direction: PathDirection,
}

/// A traceroute record together with the packet that carried it
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RouteReport {
    pub route: Vec<NodeId>,
    pub snr_towards: Vec<i32>,
    pub route_back: Vec<NodeId>,
    pub snr_back: Vec<i32>,
    /// Sender of the carrying packet
    pub packet_from: NodeId,
    /// Destination of the carrying packet
    pub packet_to: NodeId,
}

impl RouteReport {
    /// Build from a decoded `RouteDiscovery` and the carrying packet's endpoints
    pub fn new(discovery: &RouteDiscovery, packet_from: NodeId, packet_to: NodeId) -> Self {
        Self {
            route: discovery.route.iter().copied().map(NodeId::from_u32).collect(),
            snr_towards: discovery.snr_towards.clone(),
            route_back: discovery.route_back.iter().copied().map(NodeId::from_u32).collect(),
            snr_back: discovery.snr_back.clone(),
            packet_from,
            packet_to,
        }
    }

    /// `(initiator, target)` of the traceroute, or `None` if no SNR was recorded
    pub fn endpoints(&self) -> Option<(NodeId, NodeId)> {
        match (self.snr_towards.is_empty(), self.snr_back.is_empty()) {
            (true, true) => None,
            // request still on its way out
            (false, true) => Some((self.packet_from, self.packet_to)),
            // reply from the target
            _ => Some((self.packet_to, self.packet_from)),
        }
    }

    /// Recover every directed link the record describes
    ///
    /// Links touching the broadcast address are skipped. Malformed SNR arrays degrade to
    /// a partial chain with a logged warning.
    pub fn links(&self) -> Vec<TracedLink> {
        let Some((initiator, target)) = self.endpoints() else {
            return Vec::new();
        };

        let mut links = Vec::new();
        if !self.snr_towards.is_empty() {
            walk_path(
                &mut links,
                PathDirection::Towards,
                initiator,
                target,
                &self.route,
                &self.snr_towards,
            );
        }
        if !self.snr_back.is_empty() {
            walk_path(
                &mut links,
                PathDirection::Back,
                target,
                initiator,
                &self.route_back,
                &self.snr_back,
            );
        }
        links
    }

    /// Human-readable rendering of the recovered path
    pub fn format(&self) -> String {
        let mut output = String::new();
        match self.endpoints() {
            Some((initiator, target)) => {
                output.push_str(&format!("Traceroute {} -> {}\n", initiator, target));
            }
            None => {
                output.push_str("Traceroute request (no hops recorded)\n");
                return output;
            }
        }

        for link in self.links() {
            let snr = link
                .snr
                .map(|s| format!("{:.2} dB", s))
                .unwrap_or_else(|| "?".to_string());
            output.push_str(&format!(
                "  [{:>7}] {} -> {}  SNR {}\n",
                link.direction, link.from, link.to, snr
            ));
        }
        output
    }
}

fn walk_path(
    links: &mut Vec<TracedLink>,
    direction: PathDirection,
    start: NodeId,
    end: NodeId,
    hops: &[NodeId],
    snrs: &[i32],
) {
    let mut emit = |from: NodeId, to: NodeId, raw_snr: i32| {
        if from.is_broadcast() || to.is_broadcast() {
            return;
        }
        links.push(TracedLink {
            from,
            to,
            snr: snr_from_quarter_db(raw_snr),
            direction,
        });
    };

    let (Some(&first_hop), Some(&last_hop)) = (hops.first(), hops.last()) else {
        emit(start, end, snrs[0]);
        return;
    };

    emit(start, first_hop, snrs[0]);

    for i in 1..hops.len() {
        let (prev, next) = (hops[i - 1], hops[i]);
        if prev.is_broadcast() || next.is_broadcast() {
            continue;
        }
        match snrs.get(i) {
            Some(&snr) => emit(prev, next, snr),
            None => warn!(
                %direction,
                hop = i,
                snr_len = snrs.len(),
                "traceroute SNR missing for intermediate hop"
            ),
        }
    }

    if snrs.len() == hops.len() + 1 {
        emit(last_hop, end, snrs[hops.len()]);
    } else {
        warn!(
            %direction,
            hops = hops.len(),
            snr_len = snrs.len(),
            "traceroute SNR count does not cover the final hop, skipping it"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> NodeId {
        NodeId::from_u32(n)
    }

    fn report(route: &[u32], towards: &[i32], back_route: &[u32], back: &[i32]) -> RouteReport {
        RouteReport {
            route: route.iter().copied().map(id).collect(),
            snr_towards: towards.to_vec(),
            route_back: back_route.iter().copied().map(id).collect(),
            snr_back: back.to_vec(),
            packet_from: id(0xb),
            packet_to: id(0xa),
        }
    }

    fn pairs(links: &[TracedLink]) -> Vec<(u32, u32)> {
        links.iter().map(|l| (l.from.to_u32(), l.to.to_u32())).collect()
    }

    #[test]
    fn test_snr_conversion() {
        assert_eq!(snr_from_quarter_db(24), Some(6.0));
        assert_eq!(snr_from_quarter_db(-7), Some(-1.75));
        assert_eq!(snr_from_quarter_db(SNR_UNKNOWN), None);
    }

    #[test]
    fn test_request_without_snr_has_no_links() {
        let r = report(&[], &[], &[], &[]);
        assert_eq!(r.endpoints(), None);
        assert!(r.links().is_empty());
    }

    #[test]
    fn test_forward_only_direct() {
        // packet from 0xb to 0xa, towards only: initiator is the sender
        let r = report(&[], &[20], &[], &[]);
        assert_eq!(r.endpoints(), Some((id(0xb), id(0xa))));
        let links = r.links();
        assert_eq!(pairs(&links), vec![(0xb, 0xa)]);
        assert_eq!(links[0].snr, Some(5.0));
        assert_eq!(links[0].direction, PathDirection::Towards);
    }

    #[test]
    fn test_round_trip_full_chain() {
        // reply from target 0xb to initiator 0xa, one hop each way
        let r = report(&[0x1], &[8, 12], &[0x2], &[-4, SNR_UNKNOWN]);
        assert_eq!(r.endpoints(), Some((id(0xa), id(0xb))));

        let links = r.links();
        assert_eq!(
            pairs(&links),
            vec![(0xa, 0x1), (0x1, 0xb), (0xb, 0x2), (0x2, 0xa)]
        );
        assert_eq!(links[0].snr, Some(2.0));
        assert_eq!(links[1].snr, Some(3.0));
        assert_eq!(links[2].snr, Some(-1.0));
        assert_eq!(links[3].snr, None);
        assert_eq!(links[2].direction, PathDirection::Back);
    }

    #[test]
    fn test_edge_count_for_complete_records() {
        for hops in 0..5u32 {
            let route: Vec<u32> = (1..=hops).collect();
            let back: Vec<u32> = (100..100 + hops).collect();
            let snr = vec![4; hops as usize + 1];
            let r = report(&route, &snr, &back, &snr);
            assert_eq!(r.links().len(), 2 * (hops as usize + 1));
        }
    }

    #[test]
    fn test_broadcast_hops_are_skipped() {
        let r = report(&[0x1, 0xffff_ffff, 0x3], &[4, 4, 4, 4], &[], &[]);
        // a->1, (1->bcast skipped), (bcast->3 skipped), 3->b
        assert_eq!(pairs(&r.links()), vec![(0xb, 0x1), (0x3, 0xa)]);
    }

    #[test]
    fn test_short_snr_array_degrades() {
        // three hops but only two SNR values: first + one intermediate, no tail
        let r = report(&[0x1, 0x2, 0x3], &[4, 8], &[], &[]);
        assert_eq!(pairs(&r.links()), vec![(0xb, 0x1), (0x1, 0x2)]);
    }

    #[test]
    fn test_back_without_hops_is_direct() {
        let r = report(&[], &[4], &[], &[8]);
        // initiator 0xa, target 0xb
        assert_eq!(pairs(&r.links()), vec![(0xa, 0xb), (0xb, 0xa)]);
    }

    #[test]
    fn test_format_lists_links() {
        let r = report(&[0x1], &[8, SNR_UNKNOWN], &[], &[]);
        let text = r.format();
        assert!(text.contains("0000000b -> 00000001"));
        assert!(text.contains("SNR ?"));
    }
}
