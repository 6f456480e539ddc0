//! Messaging and routing plumbing shared by dqnet solvers.
//!
//! A [`Packet`] is the unit exchanged over a link. Links are pairs of bounded,
//! order-preserving tokio channels ([`link`]). The [`RoutingTable`] holds the
//! distance-vector forwarding state (FIB) a solver uses to route subgoals.

use dqnet_core::{Atom, Bindings};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Name of the synthetic atom carried by route announcements.
pub const ROUTE_MARKER: &str = "fib";

pub type Result<T> = std::result::Result<T, SwarmError>;

/// Errors surfaced by packet decoding and link plumbing.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("malformed route announcement: {0}")]
    MalformedAnnouncement(String),
    #[error("link to {0} is closed")]
    ChannelClosed(NodeId),
}

/// Identifier of a node: a solver, a data source, or a requester.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new<S: Into<String>>(s: S) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Role of the neighbor behind an interface, fixed at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Another solver; runs the routing protocol.
    SolverPeer,
    /// A data source or request originator; never routes.
    Leaf,
}

/// Packet discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Request,
    Response,
    RouteAnnounce,
}

impl PacketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Request => "request",
            PacketKind::Response => "response",
            PacketKind::RouteAnnounce => "route_announce",
        }
    }
}

/// Wire unit exchanged between nodes.
///
/// For responses, `result == None` is an explicit no-match answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub kind: PacketKind,
    pub query: Atom,
    pub result: Option<Bindings>,
}

impl Packet {
    pub fn request(query: Atom) -> Self {
        Self {
            kind: PacketKind::Request,
            query,
            result: None,
        }
    }

    pub fn response(query: Atom, result: Bindings) -> Self {
        Self {
            kind: PacketKind::Response,
            query,
            result: Some(result),
        }
    }

    pub fn no_match(query: Atom) -> Self {
        Self {
            kind: PacketKind::Response,
            query,
            result: None,
        }
    }

    /// Route announcement: `fib(dest_key, advertiser, metric)`.
    pub fn announce(dest_key: &str, advertiser: &NodeId, metric: u32) -> Self {
        Self {
            kind: PacketKind::RouteAnnounce,
            query: Atom::new(
                ROUTE_MARKER,
                [
                    dest_key.to_string(),
                    advertiser.0.clone(),
                    metric.to_string(),
                ],
            ),
            result: None,
        }
    }

    /// Extracts the announcement carried by a route packet.
    pub fn announcement(&self) -> Result<Announcement> {
        if self.kind != PacketKind::RouteAnnounce {
            return Err(SwarmError::MalformedAnnouncement(format!(
                "{:?} packet is not an announcement",
                self.kind
            )));
        }
        let [dest, advertiser, metric] = self.query.args() else {
            return Err(SwarmError::MalformedAnnouncement(format!(
                "expected 3 arguments, got {}",
                self.query.arity()
            )));
        };
        let metric = metric
            .parse::<u32>()
            .map_err(|e| SwarmError::MalformedAnnouncement(format!("metric `{metric}`: {e}")))?;
        Ok(Announcement {
            dest: dest.clone(),
            advertiser: NodeId::new(advertiser.clone()),
            metric,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SwarmError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| SwarmError::Decode(e.to_string()))
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, &self.result) {
            (PacketKind::Request, _) => write!(f, "?{}", self.query),
            (PacketKind::Response, Some(result)) => {
                write!(f, "{} --> ", self.query)?;
                for (i, (key, value)) in result.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key} = {value}")?;
                }
                Ok(())
            }
            (PacketKind::Response, None) => write!(f, "{} --> no match", self.query),
            (PacketKind::RouteAnnounce, _) => write!(f, "announce {}", self.query),
        }
    }
}

/// Decoded route announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub dest: String,
    pub advertiser: NodeId,
    /// The advertiser's own distance to `dest`.
    pub metric: u32,
}

/// A forwarding entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub nexthop: NodeId,
    pub metric: u32,
}

impl Route {
    pub fn new(nexthop: NodeId, metric: u32) -> Self {
        Self { nexthop, metric }
    }

    /// True when `other` should replace `self`: strictly smaller metric, or
    /// equal metric with a lexicographically smaller next hop.
    pub fn is_worse_than(&self, other: &Route) -> bool {
        other.metric < self.metric
            || (other.metric == self.metric && other.nexthop < self.nexthop)
    }
}

/// Effect of applying an announcement to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteUpdate {
    /// First route for the key; the caller triggers announcements.
    Installed(Route),
    Replaced { previous: Route, current: Route },
    Unchanged,
}

/// Forwarding information base: predicate key to best known route.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<String, Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Route> {
        self.routes.get(key)
    }

    /// Installs a metric-0 route to a locally attached source.
    pub fn insert_direct(&mut self, key: impl Into<String>, source: NodeId) {
        self.routes.insert(key.into(), Route::new(source, 0));
    }

    /// Installs a statically configured route, replacing any existing one.
    pub fn insert_static(&mut self, key: impl Into<String>, nexthop: NodeId, metric: u32) {
        self.routes.insert(key.into(), Route::new(nexthop, metric));
    }

    /// Applies an announcement received from a neighbor.
    ///
    /// The candidate route costs one hop more than the advertised metric.
    pub fn apply(&mut self, announcement: &Announcement) -> RouteUpdate {
        let candidate = Route::new(
            announcement.advertiser.clone(),
            announcement.metric.saturating_add(1),
        );
        match self.routes.get_mut(&announcement.dest) {
            None => {
                self.routes
                    .insert(announcement.dest.clone(), candidate.clone());
                RouteUpdate::Installed(candidate)
            }
            Some(current) if current.is_worse_than(&candidate) => {
                let previous = std::mem::replace(current, candidate.clone());
                RouteUpdate::Replaced {
                    previous,
                    current: candidate,
                }
            }
            Some(_) => RouteUpdate::Unchanged,
        }
    }

    /// Entries that may be advertised to `neighbor` under split horizon:
    /// every route whose next hop is not `neighbor`, sorted by key.
    pub fn advertisable_to(&self, neighbor: &NodeId) -> Vec<(String, u32)> {
        let mut entries: Vec<(String, u32)> = self
            .routes
            .iter()
            .filter(|(_, route)| &route.nexthop != neighbor)
            .map(|(key, route)| (key.clone(), route.metric))
            .collect();
        entries.sort();
        entries
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Route)> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// One side of a link: sends to and receives from `peer`.
#[derive(Debug)]
pub struct Endpoint {
    pub peer: NodeId,
    pub tx: mpsc::Sender<Packet>,
    pub rx: mpsc::Receiver<Packet>,
}

impl Endpoint {
    pub async fn send(&self, packet: Packet) -> Result<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| SwarmError::ChannelClosed(self.peer.clone()))
    }

    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }
}

/// Creates a bidirectional link of two bounded queues between `a` and `b`.
///
/// Returns `(a's endpoint, b's endpoint)`. Each direction buffers up to
/// `capacity` packets (at least one); delivery is reliable and in order per
/// direction.
pub fn link(a: &NodeId, b: &NodeId, capacity: usize) -> (Endpoint, Endpoint) {
    let capacity = capacity.max(1);
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (
        Endpoint {
            peer: b.clone(),
            tx: a_tx,
            rx: a_rx,
        },
        Endpoint {
            peer: a.clone(),
            tx: b_tx,
            rx: b_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(dest: &str, advertiser: &str, metric: u32) -> Announcement {
        Packet::announce(dest, &NodeId::new(advertiser), metric)
            .announcement()
            .expect("announcement")
    }

    #[test]
    fn announcement_packet_carries_key_advertiser_and_metric() {
        let pkt = Packet::announce("location/1", &NodeId::new("s3"), 2);
        assert_eq!(pkt.kind, PacketKind::RouteAnnounce);
        assert_eq!(pkt.query.name(), ROUTE_MARKER);
        assert_eq!(pkt.query.args(), ["location/1", "s3", "2"]);
        let ann = pkt.announcement().unwrap();
        assert_eq!(ann.dest, "location/1");
        assert_eq!(ann.advertiser, NodeId::new("s3"));
        assert_eq!(ann.metric, 2);
    }

    #[test]
    fn predicate_named_fib_is_not_an_announcement() {
        let pkt = Packet::request(Atom::new("fib", ["a", "b", "1"]));
        assert_eq!(pkt.kind, PacketKind::Request);
        assert!(matches!(
            pkt.announcement(),
            Err(SwarmError::MalformedAnnouncement(_))
        ));
    }

    #[test]
    fn malformed_announcements_are_rejected() {
        let mut pkt = Packet::announce("k/1", &NodeId::new("s1"), 0);
        pkt.query = Atom::new(ROUTE_MARKER, ["k/1", "s1", "far"]);
        assert!(pkt.announcement().is_err());
        pkt.query = Atom::new(ROUTE_MARKER, ["k/1", "s1"]);
        assert!(pkt.announcement().is_err());
    }

    #[test]
    fn packet_wire_roundtrip() {
        let mut result = Bindings::new();
        result.insert("?X".into(), "Westwood".into());
        let pkt = Packet::response(Atom::new("loc", ["?X"]), result);
        let decoded = Packet::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded, pkt);
        assert!(Packet::decode(&[0xff, 0x01]).is_err());
    }

    #[test]
    fn packet_display_matches_textual_form() {
        let mut result = Bindings::new();
        result.insert("?X".into(), "Westwood".into());
        let query = Atom::new("loc", ["?X"]);
        assert_eq!(
            Packet::response(query.clone(), result).to_string(),
            r#"loc("?X") --> ?X = Westwood"#
        );
        assert_eq!(Packet::request(query.clone()).to_string(), r#"?loc("?X")"#);
        assert_eq!(
            Packet::no_match(query).to_string(),
            r#"loc("?X") --> no match"#
        );
    }

    #[test]
    fn first_announcement_installs_one_hop_further() {
        let mut fib = RoutingTable::new();
        let update = fib.apply(&announcement("k/1", "s2", 1));
        assert_eq!(update, RouteUpdate::Installed(Route::new("s2".into(), 2)));
        assert_eq!(fib.get("k/1"), Some(&Route::new("s2".into(), 2)));
    }

    #[test]
    fn better_metric_replaces_and_worse_is_ignored() {
        let mut fib = RoutingTable::new();
        fib.apply(&announcement("k/1", "s4", 3));
        let update = fib.apply(&announcement("k/1", "s9", 1));
        assert_eq!(
            update,
            RouteUpdate::Replaced {
                previous: Route::new("s4".into(), 4),
                current: Route::new("s9".into(), 2),
            }
        );
        assert_eq!(fib.apply(&announcement("k/1", "s1", 5)), RouteUpdate::Unchanged);
        // repeated announcement of the installed route is stable
        assert_eq!(fib.apply(&announcement("k/1", "s9", 1)), RouteUpdate::Unchanged);
        assert_eq!(fib.get("k/1").unwrap().nexthop, NodeId::new("s9"));
    }

    #[test]
    fn equal_metric_tie_break_is_order_independent() {
        let orders = [["s3", "s2"], ["s2", "s3"]];
        for order in orders {
            let mut fib = RoutingTable::new();
            for advertiser in order {
                fib.apply(&announcement("k/1", advertiser, 1));
            }
            assert_eq!(fib.get("k/1"), Some(&Route::new("s2".into(), 2)));
        }
    }

    #[test]
    fn split_horizon_excludes_routes_learned_from_neighbor() {
        let mut fib = RoutingTable::new();
        fib.insert_direct("location/1", NodeId::new("d1"));
        fib.apply(&announcement("price/1", "s2", 0));
        fib.insert_static("item/1", NodeId::new("s4"), 3);

        let to_s2 = fib.advertisable_to(&NodeId::new("s2"));
        assert_eq!(
            to_s2,
            vec![("item/1".to_string(), 3), ("location/1".to_string(), 0)]
        );
        let to_s4 = fib.advertisable_to(&NodeId::new("s4"));
        assert_eq!(
            to_s4,
            vec![("location/1".to_string(), 0), ("price/1".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn link_delivers_in_order_both_ways() {
        let (mut a, mut b) = link(&NodeId::new("a"), &NodeId::new("b"), 0);
        assert_eq!(a.peer, NodeId::new("b"));
        assert_eq!(b.peer, NodeId::new("a"));
        let q1 = Packet::request(Atom::new("p", ["1"]));
        let q2 = Packet::request(Atom::new("p", ["2"]));
        a.send(q1.clone()).await.unwrap();
        let first = b.recv().await.unwrap();
        a.send(q2.clone()).await.unwrap();
        assert_eq!(first, q1);
        assert_eq!(b.recv().await.unwrap(), q2);

        b.send(Packet::no_match(q1.query.clone())).await.unwrap();
        assert_eq!(a.recv().await.unwrap().kind, PacketKind::Response);
    }

    #[tokio::test]
    async fn closed_link_reports_peer() {
        let (a, b) = link(&NodeId::new("a"), &NodeId::new("b"), 1);
        drop(b);
        let err = a
            .send(Packet::request(Atom::new("p", ["1"])))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::ChannelClosed(id) if id == NodeId::new("b")));
    }
}
