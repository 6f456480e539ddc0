//! Solver engine for dqnet.
//!
//! A [`Solver`] decomposes incoming queries with its local rules, forwards
//! the resulting subgoals along its routing table, aggregates the answers that
//! come back, and propagates route announcements to neighboring solvers.
//!
//! All per-solver tables (rules, FIB, pending requests, interfaces) live behind
//! one lock. Packet handling runs to completion under that lock and yields the
//! packets to send; sending happens after the lock is released, so no lock is
//! ever held across an await point.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dqnet_core::{compose, translate, Atom, Bindings, ParseError, Rule};
use dqnet_swarm::{
    link, Endpoint, NodeId, Packet, PacketKind, Role, Route, RouteUpdate, RoutingTable,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

pub type Result<T> = std::result::Result<T, SolverError>;

/// Errors surfaced while configuring or starting a solver.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("invalid rule: {0}")]
    Parse(#[from] ParseError),
    #[error("no interface attached for {0}")]
    UnknownNeighbor(NodeId),
    #[error("interface for {0} is already attached")]
    DuplicateInterface(NodeId),
    #[error("solver {0} is already running")]
    AlreadyRunning(NodeId),
}

/// Tunables for a solver.
#[derive(Clone, Debug)]
pub struct SolverConfig {
    /// Idle time on a peer link before the solver re-announces its routes
    /// there. A busy link is refreshed on the first packet received once this
    /// long has passed since the previous refresh.
    pub announce_interval: Duration,
    /// Per-direction capacity of links created by this solver.
    pub link_capacity: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_millis(200),
            link_capacity: 16,
        }
    }
}

/// In-flight query state, keyed by the query atom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    pub query: Atom,
    /// Parent query this entry answers into, if it is a subgoal.
    pub solve: Option<Atom>,
    /// Subgoals still awaiting an answer.
    pub depend: HashSet<Atom>,
    /// Bindings merged from answered subgoals.
    pub results: Bindings,
    pub compose: Option<Atom>,
    /// Head unification map of the matched rule; `None` for forwarded queries.
    pub unify: Option<Bindings>,
    /// Interface the query arrived on; set for top-level queries only.
    pub origin: Option<NodeId>,
}

/// A packet addressed to one of the solver's neighbors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub to: NodeId,
    pub packet: Packet,
}

impl Outbound {
    pub fn new(to: NodeId, packet: Packet) -> Self {
        Self { to, packet }
    }
}

/// How a query was handled by [`Solver::solve_and_forward`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Forwarding {
    /// Matched this many local rules; their subgoals were solved recursively.
    Decomposed(usize),
    /// Sent toward the route's next hop.
    Forwarded(NodeId),
    /// Recorded without a usable route. The entry waits for an answer that
    /// may never come.
    NoRoute,
}

/// Outcome of delivering an answer to the pending request table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Consumption {
    Consumed,
    /// No pending entry for the query; the answer was dropped.
    UnknownQuery,
}

struct Interface {
    role: Role,
    tx: mpsc::Sender<Packet>,
}

struct SolverState {
    id: NodeId,
    rules: Vec<Rule>,
    fib: RoutingTable,
    prt: HashMap<Atom, PendingRequest>,
    ift: HashMap<NodeId, Interface>,
}

impl SolverState {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            rules: Vec::new(),
            fib: RoutingTable::new(),
            prt: HashMap::new(),
            ift: HashMap::new(),
        }
    }

    /// Solver peers, sorted, minus `except`.
    fn peers_except(&self, except: &[&NodeId]) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .ift
            .iter()
            .filter(|(id, iface)| iface.role == Role::SolverPeer && !except.contains(id))
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// True when `query` already appears on the chain of parents above `parent`.
    fn is_ancestor(&self, query: &Atom, parent: Option<&Atom>) -> bool {
        let mut cursor = parent;
        for _ in 0..=self.prt.len() {
            let Some(atom) = cursor else {
                return false;
            };
            if atom == query {
                return true;
            }
            cursor = self.prt.get(atom).and_then(|entry| entry.solve.as_ref());
        }
        false
    }

    fn record(&mut self, entry: PendingRequest) {
        if let Some(previous) = self.prt.insert(entry.query.clone(), entry) {
            debug!(
                solver = %self.id,
                query = %previous.query,
                "pending request replaced"
            );
        }
    }

    fn solve_and_forward(
        &mut self,
        origin: Option<NodeId>,
        query: Atom,
        parent: Option<Atom>,
        out: &mut Vec<Outbound>,
    ) -> Forwarding {
        if self.is_ancestor(&query, parent.as_ref()) {
            warn!(solver = %self.id, query = %query, "cyclic subgoal left unsolved");
            return Forwarding::NoRoute;
        }

        let matches: Vec<(Rule, Bindings)> = self
            .rules
            .iter()
            .filter_map(|rule| {
                rule.unify(&query)
                    .into_bindings()
                    .map(|head_map| (rule.clone(), head_map))
            })
            .collect();

        if !matches.is_empty() {
            let count = matches.len();
            for (rule, head_map) in matches {
                debug!(solver = %self.id, query = %query, rule = %rule, "query matched rule");
                self.record(PendingRequest {
                    query: query.clone(),
                    solve: parent.clone(),
                    depend: rule.subgoals().cloned().collect(),
                    results: Bindings::new(),
                    compose: rule.composition().cloned(),
                    unify: Some(head_map),
                    origin: origin.clone(),
                });
                if rule.subgoals().next().is_none() {
                    self.consume(&query, Bindings::new(), &query, out);
                    continue;
                }
                for subgoal in rule.subgoals() {
                    self.solve_and_forward(None, subgoal.clone(), Some(query.clone()), out);
                }
            }
            return Forwarding::Decomposed(count);
        }

        let nexthop = self
            .fib
            .get(&query.key())
            .map(|route| route.nexthop.clone());
        self.record(PendingRequest {
            query: query.clone(),
            solve: parent,
            depend: HashSet::new(),
            results: Bindings::new(),
            compose: None,
            unify: None,
            origin: origin.clone(),
        });

        match nexthop {
            Some(nexthop) if origin.as_ref() == Some(&nexthop) => {
                warn!(
                    solver = %self.id,
                    query = %query,
                    nexthop = %nexthop,
                    "route points back at the requester; query left pending"
                );
                self.note_unrouted();
                Forwarding::NoRoute
            }
            Some(nexthop) if self.ift.contains_key(&nexthop) => {
                debug!(solver = %self.id, query = %query, nexthop = %nexthop, "forwarding query");
                out.push(Outbound::new(nexthop.clone(), Packet::request(query)));
                Forwarding::Forwarded(nexthop)
            }
            Some(nexthop) => {
                warn!(
                    solver = %self.id,
                    query = %query,
                    nexthop = %nexthop,
                    "next hop has no interface; query left pending"
                );
                self.note_unrouted();
                Forwarding::NoRoute
            }
            None => {
                debug!(solver = %self.id, query = %query, "no route; query left pending");
                self.note_unrouted();
                Forwarding::NoRoute
            }
        }
    }

    fn note_unrouted(&self) {
        #[cfg(feature = "metrics")]
        dqnet_metrics::record_query_unrouted(self.id.as_str());
    }

    /// Delivers `bindings` for `from` to the pending entry for `query`.
    ///
    /// `from == query` means the entry itself is answered: it is removed,
    /// composed, translated into the caller's variables, and passed up to its
    /// parent or back to its origin. Otherwise `from` is one of the entry's
    /// subgoals; its bindings are merged and the entry completes once every
    /// subgoal has answered.
    fn consume(
        &mut self,
        query: &Atom,
        bindings: Bindings,
        from: &Atom,
        out: &mut Vec<Outbound>,
    ) -> Consumption {
        if from == query {
            let Some(entry) = self.prt.remove(query) else {
                return Consumption::UnknownQuery;
            };
            let mut bindings = bindings;
            if let Some(pattern) = &entry.compose {
                compose(pattern, &mut bindings);
            }
            let answer = match &entry.unify {
                Some(head_map) => translate(head_map, &bindings),
                None => bindings,
            };
            match (entry.solve, entry.origin) {
                (Some(parent), _) => {
                    self.consume(&parent, answer, query, out);
                }
                (None, Some(origin)) => {
                    debug!(solver = %self.id, query = %query, origin = %origin, "query answered");
                    out.push(Outbound::new(origin, Packet::response(query.clone(), answer)));
                }
                (None, None) => {
                    warn!(solver = %self.id, query = %query, "answered query has no origin");
                }
            }
            return Consumption::Consumed;
        }

        let Some(entry) = self.prt.get_mut(query) else {
            return Consumption::UnknownQuery;
        };
        entry.results.extend(bindings);
        entry.depend.remove(from);
        trace!(
            solver = %self.id,
            query = %query,
            subgoal = %from,
            remaining = entry.depend.len(),
            "subgoal answered"
        );
        if entry.depend.is_empty() {
            let results = std::mem::take(&mut entry.results);
            self.consume(query, results, query, out);
        }
        Consumption::Consumed
    }

    fn handle_announcement(
        &mut self,
        from: &NodeId,
        packet: &Packet,
        out: &mut Vec<Outbound>,
    ) -> RouteUpdate {
        let role = self.ift.get(from).map(|iface| iface.role);
        if role != Some(Role::SolverPeer) {
            debug!(solver = %self.id, from = %from, "ignoring route announcement from non-peer");
            return RouteUpdate::Unchanged;
        }
        let announcement = match packet.announcement() {
            Ok(announcement) => announcement,
            Err(err) => {
                warn!(solver = %self.id, from = %from, %err, "dropping route announcement");
                return RouteUpdate::Unchanged;
            }
        };

        let update = self.fib.apply(&announcement);
        match &update {
            RouteUpdate::Installed(route) => {
                info!(
                    solver = %self.id,
                    key = %announcement.dest,
                    nexthop = %route.nexthop,
                    metric = route.metric,
                    "route installed"
                );
                for peer in self.peers_except(&[from, &route.nexthop]) {
                    out.push(Outbound::new(
                        peer,
                        Packet::announce(&announcement.dest, &self.id, route.metric),
                    ));
                }
                #[cfg(feature = "metrics")]
                dqnet_metrics::record_route_update(self.id.as_str(), "installed");
            }
            RouteUpdate::Replaced { previous, current } => {
                info!(
                    solver = %self.id,
                    key = %announcement.dest,
                    from = %previous.nexthop,
                    to = %current.nexthop,
                    metric = current.metric,
                    "route replaced"
                );
                #[cfg(feature = "metrics")]
                dqnet_metrics::record_route_update(self.id.as_str(), "replaced");
            }
            RouteUpdate::Unchanged => {
                trace!(solver = %self.id, key = %announcement.dest, "route unchanged");
            }
        }
        update
    }

    fn advertisement(&self, neighbor: &NodeId) -> Vec<Outbound> {
        self.fib
            .advertisable_to(neighbor)
            .into_iter()
            .map(|(key, metric)| {
                Outbound::new(neighbor.clone(), Packet::announce(&key, &self.id, metric))
            })
            .collect()
    }

    fn handle(&mut self, from: &NodeId, packet: Packet) -> Vec<Outbound> {
        let mut out = Vec::new();
        match packet.kind {
            PacketKind::Request => {
                debug!(solver = %self.id, from = %from, packet = %packet, "request received");
                self.solve_and_forward(Some(from.clone()), packet.query, None, &mut out);
            }
            PacketKind::Response => match packet.result {
                Some(result) => {
                    let query = packet.query;
                    if self.consume(&query, result, &query, &mut out) == Consumption::UnknownQuery {
                        debug!(solver = %self.id, query = %query, "dropping answer for unknown query");
                        #[cfg(feature = "metrics")]
                        dqnet_metrics::record_answer_unmatched(self.id.as_str());
                    }
                }
                None => {
                    info!(
                        solver = %self.id,
                        from = %from,
                        query = %packet.query,
                        "no match reported; query left pending"
                    );
                }
            },
            PacketKind::RouteAnnounce => {
                self.handle_announcement(from, &packet, &mut out);
            }
        }
        out
    }
}

/// A query-routing node.
pub struct Solver {
    id: NodeId,
    config: SolverConfig,
    state: Mutex<SolverState>,
    receivers: Mutex<Vec<(NodeId, Role, mpsc::Receiver<Packet>)>>,
    running: AtomicBool,
}

impl Solver {
    pub fn new(id: NodeId, config: SolverConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SolverState::new(id.clone())),
            id,
            config,
            receivers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(SolverError::AlreadyRunning(self.id.clone()));
        }
        Ok(())
    }

    /// Attaches the local side of a link; the neighbor is `endpoint.peer`.
    ///
    /// Interfaces are fixed once the solver is spawned.
    pub fn attach_interface(&self, role: Role, endpoint: Endpoint) -> Result<()> {
        self.ensure_idle()?;
        let Endpoint { peer, tx, rx } = endpoint;
        {
            let mut state = self.state.lock();
            if state.ift.contains_key(&peer) {
                return Err(SolverError::DuplicateInterface(peer));
            }
            state.ift.insert(peer.clone(), Interface { role, tx });
        }
        debug!(solver = %self.id, neighbor = %peer, ?role, "interface attached");
        self.receivers.lock().push((peer, role, rx));
        Ok(())
    }

    /// Attaches a data source serving `key` and returns the source's end of
    /// the link.
    ///
    /// Installs a direct route and announces it to every solver peer.
    pub fn attach_source(&self, source: &NodeId, key: &str) -> Result<Endpoint> {
        let (local, remote) = link(&self.id, source, self.config.link_capacity);
        self.attach_interface(Role::Leaf, local)?;
        let announcements = {
            let mut state = self.state.lock();
            state.fib.insert_direct(key, source.clone());
            state
                .peers_except(&[])
                .into_iter()
                .map(|peer| Outbound::new(peer, Packet::announce(key, &self.id, 0)))
                .collect::<Vec<_>>()
        };
        info!(solver = %self.id, source = %source, key, "direct route installed");
        self.offer(announcements);
        Ok(remote)
    }

    /// Attaches a request originator and returns its end of the link.
    pub fn attach_request(&self, request: &NodeId) -> Result<Endpoint> {
        let (local, remote) = link(&self.id, request, self.config.link_capacity);
        self.attach_interface(Role::Leaf, local)?;
        Ok(remote)
    }

    /// Parses and appends a rule. Rules are tried in insertion order.
    pub fn add_rule(&self, text: &str) -> Result<Rule> {
        let rule = Rule::parse(text)?;
        debug!(solver = %self.id, rule = %rule, "rule added");
        self.state.lock().rules.push(rule.clone());
        Ok(rule)
    }

    /// Installs a static route for `key` through `neighbor`.
    pub fn add_forwarding_entry(&self, key: &str, neighbor: &NodeId, metric: u32) -> Result<()> {
        let mut state = self.state.lock();
        if !state.ift.contains_key(neighbor) {
            return Err(SolverError::UnknownNeighbor(neighbor.clone()));
        }
        state.fib.insert_static(key, neighbor.clone(), metric);
        debug!(solver = %self.id, key, nexthop = %neighbor, metric, "static route installed");
        Ok(())
    }

    /// Handles one packet received from `from` and returns what to send.
    pub fn handle_packet(&self, from: &NodeId, packet: Packet) -> Vec<Outbound> {
        #[cfg(feature = "metrics")]
        dqnet_metrics::record_packet_received(self.id.as_str(), packet.kind.as_str());
        let mut state = self.state.lock();
        let out = state.handle(from, packet);
        #[cfg(feature = "metrics")]
        dqnet_metrics::record_pending_requests(self.id.as_str(), state.prt.len());
        out
    }

    /// Records `query` and either decomposes it with local rules or forwards
    /// it along the FIB.
    pub fn solve_and_forward(
        &self,
        origin: Option<NodeId>,
        query: Atom,
        parent: Option<Atom>,
    ) -> (Forwarding, Vec<Outbound>) {
        let mut out = Vec::new();
        let forwarding = self
            .state
            .lock()
            .solve_and_forward(origin, query, parent, &mut out);
        (forwarding, out)
    }

    /// Delivers an answer for `from` into the pending entry for `query`.
    pub fn consume_pending(
        &self,
        query: &Atom,
        bindings: Bindings,
        from: &Atom,
    ) -> (Consumption, Vec<Outbound>) {
        let mut out = Vec::new();
        let consumption = self.state.lock().consume(query, bindings, from, &mut out);
        (consumption, out)
    }

    /// Announcements for every route `neighbor` may learn from us.
    pub fn advertisement(&self, neighbor: &NodeId) -> Vec<Outbound> {
        self.state.lock().advertisement(neighbor)
    }

    pub fn route(&self, key: &str) -> Option<Route> {
        self.state.lock().fib.get(key).cloned()
    }

    pub fn routes(&self) -> Vec<(String, Route)> {
        let state = self.state.lock();
        let mut routes: Vec<(String, Route)> = state
            .fib
            .iter()
            .map(|(key, route)| (key.clone(), route.clone()))
            .collect();
        routes.sort_by(|a, b| a.0.cmp(&b.0));
        routes
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().prt.len()
    }

    pub fn pending(&self, query: &Atom) -> Option<PendingRequest> {
        self.state.lock().prt.get(query).cloned()
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.state.lock().rules.clone()
    }

    pub fn neighbors(&self) -> Vec<(NodeId, Role)> {
        let state = self.state.lock();
        let mut neighbors: Vec<(NodeId, Role)> = state
            .ift
            .iter()
            .map(|(id, iface)| (id.clone(), iface.role))
            .collect();
        neighbors.sort_by(|a, b| a.0.cmp(&b.0));
        neighbors
    }

    /// Starts one task per attached interface.
    pub fn spawn(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SolverError::AlreadyRunning(self.id.clone()));
        }
        let receivers = std::mem::take(&mut *self.receivers.lock());
        info!(solver = %self.id, interfaces = receivers.len(), "solver starting");
        Ok(receivers
            .into_iter()
            .map(|(neighbor, role, rx)| {
                let solver = Arc::clone(self);
                match role {
                    Role::SolverPeer => tokio::spawn(solver.peer_loop(neighbor, rx)),
                    Role::Leaf => tokio::spawn(solver.leaf_loop(neighbor, rx)),
                }
            })
            .collect())
    }

    /// Receives from a peer and refreshes routes toward it when the link has
    /// been idle for `announce_interval`. A peer that keeps the link busy
    /// still gets a refresh once per interval, so solvers with different
    /// intervals cannot starve each other.
    async fn peer_loop(self: Arc<Self>, neighbor: NodeId, mut rx: mpsc::Receiver<Packet>) {
        let interval = self.config.announce_interval;
        let mut last_refresh = Instant::now();
        loop {
            tokio::select! {
                biased;
                packet = rx.recv() => match packet {
                    Some(packet) => {
                        self.receive(&neighbor, packet).await;
                        if last_refresh.elapsed() >= interval {
                            self.refresh(&neighbor);
                            last_refresh = Instant::now();
                        }
                    }
                    None => {
                        warn!(solver = %self.id, neighbor = %neighbor, "peer link closed");
                        break;
                    }
                },
                _ = tokio::time::sleep(interval) => {
                    self.refresh(&neighbor);
                    last_refresh = Instant::now();
                }
            }
        }
    }

    async fn leaf_loop(self: Arc<Self>, neighbor: NodeId, mut rx: mpsc::Receiver<Packet>) {
        while let Some(packet) = rx.recv().await {
            self.receive(&neighbor, packet).await;
        }
        debug!(solver = %self.id, neighbor = %neighbor, "leaf link closed");
    }

    async fn receive(&self, from: &NodeId, packet: Packet) {
        let outbound = self.handle_packet(from, packet);
        self.dispatch(outbound).await;
    }

    /// Periodic re-announcement toward an idle peer.
    fn refresh(&self, neighbor: &NodeId) {
        let announcements = self.advertisement(neighbor);
        trace!(
            solver = %self.id,
            neighbor = %neighbor,
            routes = announcements.len(),
            "refreshing routes"
        );
        self.offer(announcements);
    }

    fn sender(&self, to: &NodeId) -> Option<mpsc::Sender<Packet>> {
        self.state.lock().ift.get(to).map(|iface| iface.tx.clone())
    }

    /// Sends requests and responses, waiting for queue space. Announcements
    /// go through [`Solver::offer`].
    async fn dispatch(&self, outbound: Vec<Outbound>) {
        let (announcements, data): (Vec<_>, Vec<_>) = outbound
            .into_iter()
            .partition(|o| o.packet.kind == PacketKind::RouteAnnounce);
        self.offer(announcements);

        for Outbound { to, packet } in data {
            let Some(tx) = self.sender(&to) else {
                warn!(solver = %self.id, to = %to, "no interface for outbound packet");
                continue;
            };
            #[cfg(feature = "metrics")]
            let kind = packet.kind;
            trace!(solver = %self.id, to = %to, packet = %packet, "sending");
            if tx.send(packet).await.is_err() {
                warn!(solver = %self.id, to = %to, "link closed; packet lost");
                continue;
            }
            #[cfg(feature = "metrics")]
            dqnet_metrics::record_packet_sent(self.id.as_str(), kind.as_str());
        }
    }

    /// Queues announcements without waiting. A full peer queue drops the
    /// announcement; the next refresh toward that peer carries it again.
    fn offer(&self, announcements: Vec<Outbound>) {
        let mut dropped = 0u64;
        for Outbound { to, packet } in announcements {
            let Some(tx) = self.sender(&to) else {
                continue;
            };
            match tx.try_send(packet) {
                Ok(()) => {
                    #[cfg(feature = "metrics")]
                    dqnet_metrics::record_packet_sent(
                        self.id.as_str(),
                        PacketKind::RouteAnnounce.as_str(),
                    );
                }
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Closed(_)) => {
                    debug!(solver = %self.id, to = %to, "peer link closed; announcement dropped");
                }
            }
        }
        if dropped > 0 {
            debug!(solver = %self.id, dropped, "peer queue full; announcements deferred");
            #[cfg(feature = "metrics")]
            dqnet_metrics::record_announce_dropped(self.id.as_str(), dropped);
        }
    }
}

/// Links two solvers as peers.
pub fn connect(a: &Solver, b: &Solver) -> Result<()> {
    let capacity = a.config.link_capacity.max(b.config.link_capacity);
    let (a_end, b_end) = link(&a.id, &b.id, capacity);
    a.attach_interface(Role::SolverPeer, a_end)?;
    b.attach_interface(Role::SolverPeer, b_end)?;
    Ok(())
}
