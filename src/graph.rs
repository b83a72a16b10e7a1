//! Topology engine: per-node state, flooded advertisements, shortest paths
//!
//! Every node advertises a signed `State` carrying its key-agreement public
//! key, capability flags and current neighbor set. States are flooded and
//! merged under a monotonic-sequence rule into a vertex arena; edges are
//! identifier sets into the same arena, so the graph holds no cyclic
//! ownership. Whenever the edge set changes the next-hop table is
//! recomputed and swapped into the routing fabric.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::binary::Reader;
use crate::crypto::{EcdhPair, Identifier, SigningPair, ECDH_PUBLIC_SIZE, IDENTIFIER_SIZE};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::message::{sequence_newer, Message, MessageType};
use crate::routing::{Routing, RoutingTable};
use crate::scheduler::Scheduler;

pub const PROVISION_NONE: u32 = 0x0;
pub const PROVISION_HAS_WEBSOCKET: u32 = 0x1;
pub const PROVISION_HAS_TURN: u32 = 0x2;

/// Minimum interval between local State floods triggered by remote vertex
/// discovery or key rotation; later requests are coalesced.
const MIN_STATE_FLOOD_INTERVAL: Duration = Duration::from_secs(1);

/// Ticks without a State refresh after which a non-neighbor vertex is
/// dropped (~3 minutes at the 200 ms reference cadence).
const VERTEX_EXPIRY_TICKS: u64 = 900;

/// Periodic re-flood of the local State so remote caches keep refreshing
/// well within the expiry window.
const STATE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// A node's signed advertisement.
#[derive(Debug, Clone)]
pub struct State {
    pub id: Identifier,
    pub sequence: u32,
    pub provision: u32,
    pub ecdh_public: [u8; ECDH_PUBLIC_SIZE],
    pub neighbors: BTreeSet<Identifier>,
}

impl State {
    pub fn new(id: Identifier, sequence: u32, ecdh_public: [u8; ECDH_PUBLIC_SIZE]) -> Self {
        Self { id, sequence, provision: PROVISION_NONE, ecdh_public, neighbors: BTreeSet::new() }
    }

    pub fn to_message(&self, pair: &SigningPair) -> Result<Message> {
        let mut body =
            Vec::with_capacity(4 + ECDH_PUBLIC_SIZE + self.neighbors.len() * IDENTIFIER_SIZE);
        body.extend_from_slice(&self.provision.to_be_bytes());
        body.extend_from_slice(&self.ecdh_public);
        for id in &self.neighbors {
            body.extend_from_slice(id.as_bytes());
        }
        Message::signed(MessageType::State, self.sequence, body, pair, None)
    }

    pub fn from_message(message: &Message) -> Result<Self> {
        if message.kind != MessageType::State {
            return Err(Error::Malformed("not a State message"));
        }
        let source = message.source.ok_or(Error::Malformed("State without source"))?;

        let mut reader = Reader::new(&message.body);
        let provision = reader.read_u32()?;
        let ecdh_public = reader.read_array::<ECDH_PUBLIC_SIZE>()?;

        let mut neighbors = BTreeSet::new();
        while reader.left() >= IDENTIFIER_SIZE {
            neighbors.insert(Identifier::from_bytes(reader.read(IDENTIFIER_SIZE)?)?);
        }
        if reader.left() > 0 {
            warn!("{} bytes left over in State from {}", reader.left(), source);
        }

        Ok(Self { id: source, sequence: message.sequence, provision, ecdh_public, neighbors })
    }
}

struct Vertex {
    state: Option<State>,
    edges: BTreeSet<Identifier>,
    last_refresh_tick: u64,
    // Transient shortest-path working set, reset every recomputation.
    next_hop: Option<Identifier>,
    distance: Option<u32>,
    visited: bool,
}

impl Vertex {
    fn new(tick: u64) -> Self {
        Self {
            state: None,
            edges: BTreeSet::new(),
            last_refresh_tick: tick,
            next_hop: None,
            distance: None,
            visited: false,
        }
    }
}

struct Inner {
    vertices: HashMap<Identifier, Vertex>,
    hello_sequence: u32,
    state_sequence: u32,
    last_state_flood: Option<Instant>,
    flood_scheduled: bool,
    tick: u64,
}

pub struct Graph {
    local_id: Identifier,
    signing: Arc<SigningPair>,
    ecdh: Arc<EcdhPair>,
    provision: u32,
    routing: Arc<Routing>,
    scheduler: Arc<Scheduler>,
    inner: RwLock<Inner>,
}

impl Graph {
    pub fn new(
        signing: Arc<SigningPair>,
        provision: u32,
        routing: Arc<Routing>,
        scheduler: Arc<Scheduler>,
    ) -> Arc<Self> {
        let graph = Arc::new(Self {
            local_id: signing.id(),
            signing,
            ecdh: Arc::new(EcdhPair::generate()),
            provision,
            routing,
            scheduler,
            inner: RwLock::new(Inner {
                vertices: HashMap::new(),
                hello_sequence: 0,
                state_sequence: 0,
                last_state_flood: None,
                flood_scheduled: false,
                tick: 0,
            }),
        });

        // Seed the local vertex one sequence behind so the first real flood
        // supersedes it.
        {
            let mut inner = graph.inner.write();
            let mut state = State::new(graph.local_id, 0u32.wrapping_sub(1), *graph.ecdh.public());
            state.provision = graph.provision;
            let mut vertex = Vertex::new(0);
            vertex.state = Some(state);
            inner.vertices.insert(graph.local_id, vertex);
        }

        graph
    }

    pub fn local_id(&self) -> Identifier {
        self.local_id
    }

    pub fn local_ecdh(&self) -> &Arc<EcdhPair> {
        &self.ecdh
    }

    /// One node tick: gossip a Hello and expire stale vertices.
    pub fn update(self: &Arc<Self>) {
        let hello = {
            let mut inner = self.inner.write();
            inner.tick += 1;
            let sequence = inner.hello_sequence;
            inner.hello_sequence = inner.hello_sequence.wrapping_add(1);
            Message::signed(MessageType::Hello, sequence, Vec::new(), &self.signing, None)
        };

        match hello {
            Ok(hello) => self.routing.broadcast(&hello, None),
            Err(e) => error!("Cannot build Hello: {}", e),
        }

        let refresh_due = {
            let inner = self.inner.read();
            inner
                .last_state_flood
                .map_or(false, |last| last.elapsed() >= STATE_REFRESH_INTERVAL)
        };
        if refresh_due {
            self.broadcast_state();
        }

        self.expire_vertices();
    }

    /// Reacts to routing events: Hello registers neighbors, State merges
    /// and re-floods, neighbor changes update the local adjacency.
    pub fn handle_event(self: &Arc<Self>, event: &Event) {
        match event {
            Event::Message { message, channel } => match message.kind {
                MessageType::Hello => {
                    let (Some(source), Some(channel)) = (message.source, channel.as_ref()) else {
                        return;
                    };
                    if !self.routing.has_neighbor(&source) {
                        debug!("New Hello from {}", source);
                        self.routing.add_neighbor(source, channel.clone());
                    }
                }
                MessageType::State => {
                    let state = match State::from_message(message) {
                        Ok(state) => state,
                        Err(e) => {
                            debug!("Dropping invalid State: {}", e);
                            return;
                        }
                    };
                    let source = state.id;
                    if source == self.local_id {
                        return;
                    }
                    if self.insert(state) {
                        // Re-flood the original signed advertisement; stale
                        // copies die at the next hop's sequence check.
                        self.routing.broadcast(message, channel.as_ref().map(|c| c.id()));
                    } else {
                        debug!("Ignoring stale State from {}", source);
                    }
                }
                _ => {}
            },
            Event::Neighbor { .. } => {
                let neighbors = self.routing.neighbors();
                debug!("Neighbors changed, count={}", neighbors.len());
                let changed = {
                    let mut inner = self.inner.write();
                    match self.update_edges(&mut inner, self.local_id, &neighbors) {
                        Ok(changed) => changed,
                        Err(e) => {
                            error!("Edge update failed: {}", e);
                            return;
                        }
                    }
                };
                if changed {
                    self.broadcast_state();
                }
            }
        }
    }

    /// Merges a remote State. Returns whether it superseded the cached one.
    pub fn insert(self: &Arc<Self>, state: State) -> bool {
        let (accepted, want_flood) = {
            let mut inner = self.inner.write();
            match self.update_vertex(&mut inner, state) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("State merge failed: {}", e);
                    return false;
                }
            }
        };

        if want_flood {
            self.request_state_flood();
        }
        accepted
    }

    /// Returns the cached State for `id`, or `UnknownPeer`.
    pub fn get(&self, id: &Identifier) -> Result<State> {
        let inner = self.inner.read();
        inner
            .vertices
            .get(id)
            .and_then(|vertex| vertex.state.clone())
            .ok_or(Error::UnknownPeer)
    }

    /// Identifiers of every vertex with a known State advertising all bits
    /// of `provision`.
    pub fn nodes(&self, provision: u32) -> Vec<Identifier> {
        let inner = self.inner.read();
        inner
            .vertices
            .iter()
            .filter_map(|(id, vertex)| match &vertex.state {
                Some(state) if state.provision & provision == provision => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner.read().vertices.len()
    }

    /// Floods a fresh local State immediately (neighbor changes are worth
    /// telling the network about right away).
    pub fn broadcast_state(self: &Arc<Self>) {
        let message = {
            let neighbors = self.routing.neighbors();
            let mut inner = self.inner.write();
            let sequence = inner.state_sequence;
            inner.state_sequence = inner.state_sequence.wrapping_add(1);

            let mut state = State::new(self.local_id, sequence, *self.ecdh.public());
            state.provision = self.provision;
            state.neighbors = neighbors;

            let message = state.to_message(&self.signing);
            if let Err(e) = self.update_vertex(&mut inner, state) {
                error!("Cannot merge local State: {}", e);
            }
            inner.last_state_flood = Some(Instant::now());
            message
        };

        match message {
            Ok(message) => self.routing.broadcast(&message, None),
            Err(e) => error!("Cannot build State: {}", e),
        }
    }

    /// Requests a local State flood, coalesced to at most one per
    /// `MIN_STATE_FLOOD_INTERVAL` through the scheduler.
    fn request_state_flood(self: &Arc<Self>) {
        let due = {
            let mut inner = self.inner.write();
            if inner.flood_scheduled {
                return;
            }
            match inner.last_state_flood {
                Some(last) if last.elapsed() < MIN_STATE_FLOOD_INTERVAL => {
                    inner.flood_scheduled = true;
                    Some(last + MIN_STATE_FLOOD_INTERVAL)
                }
                _ => None,
            }
        };

        match due {
            None => self.broadcast_state(),
            Some(due) => {
                let weak: Weak<Graph> = Arc::downgrade(self);
                self.scheduler.schedule_at(due, move || {
                    if let Some(graph) = weak.upgrade() {
                        graph.inner.write().flood_scheduled = false;
                        graph.broadcast_state();
                    }
                });
            }
        }
    }

    fn expire_vertices(self: &Arc<Self>) {
        let neighbors = self.routing.neighbors();
        let mut inner = self.inner.write();
        let tick = inner.tick;
        let stale: Vec<Identifier> = inner
            .vertices
            .iter()
            .filter(|(id, vertex)| {
                **id != self.local_id
                    && !neighbors.contains(id)
                    && tick.saturating_sub(vertex.last_refresh_tick) > VERTEX_EXPIRY_TICKS
            })
            .map(|(id, _)| *id)
            .collect();

        if stale.is_empty() {
            return;
        }

        for id in &stale {
            info!("Expiring silent node {}", id);
            inner.vertices.remove(id);
            // Dangling edge references are skipped during computation.
        }

        if let Err(e) = self.recompute(&mut inner) {
            error!("Routing recomputation failed: {}", e);
        }
    }

    /// Merges `state` into its vertex. Returns (superseded the cached
    /// state, wants a local re-flood).
    fn update_vertex(&self, inner: &mut Inner, state: State) -> Result<(bool, bool)> {
        let tick = inner.tick;
        let id = state.id;

        let want_flood = match inner.vertices.get(&id) {
            Some(vertex) => match &vertex.state {
                Some(cached) => {
                    if !sequence_newer(state.sequence, cached.sequence) {
                        return Ok((false, false));
                    }
                    cached.ecdh_public != state.ecdh_public
                }
                None => true,
            },
            None => true,
        };

        if id != self.local_id {
            debug!(
                "New state from {}, sequence={}, neighbors={}, key={}",
                id,
                state.sequence,
                state.neighbors.len(),
                hex::encode(&state.ecdh_public[1..9])
            );
        }

        let neighbors = state.neighbors.clone();
        let vertex = inner.vertices.entry(id).or_insert_with(|| Vertex::new(tick));
        vertex.state = Some(state);
        vertex.last_refresh_tick = tick;

        // The caller floods if needed; edge changes recompute the table.
        self.update_edges(inner, id, &neighbors)?;
        Ok((true, want_flood && id != self.local_id))
    }

    /// Applies the difference between a vertex's current edges and its
    /// advertised neighbor set. Removed neighbors are unlinked but their
    /// vertices stay. Returns whether anything changed.
    fn update_edges(
        &self,
        inner: &mut Inner,
        id: Identifier,
        neighbors: &BTreeSet<Identifier>,
    ) -> Result<bool> {
        let tick = inner.tick;
        let current: BTreeSet<Identifier> = match inner.vertices.get(&id) {
            Some(vertex) => vertex.edges.clone(),
            None => return Err(Error::Internal(format!("vertex {} not found", id))),
        };

        let added: Vec<Identifier> = neighbors.difference(&current).copied().collect();
        let removed: Vec<Identifier> = current.difference(neighbors).copied().collect();
        if added.is_empty() && removed.is_empty() {
            return Ok(false);
        }

        for other in &added {
            inner.vertices.entry(*other).or_insert_with(|| Vertex::new(tick));
        }
        let vertex = inner
            .vertices
            .get_mut(&id)
            .ok_or_else(|| Error::Internal(format!("vertex {} not found", id)))?;
        for other in &removed {
            vertex.edges.remove(other);
        }
        for other in &added {
            vertex.edges.insert(*other);
        }

        self.recompute(inner)?;
        Ok(true)
    }

    /// Single-source shortest path (unit edge weights) rooted at the local
    /// vertex; rebuilds the next-hop table and swaps it into routing.
    fn recompute(&self, inner: &mut Inner) -> Result<()> {
        for vertex in inner.vertices.values_mut() {
            vertex.next_hop = None;
            vertex.distance = None;
            vertex.visited = false;
        }

        {
            let local = inner
                .vertices
                .get_mut(&self.local_id)
                .ok_or_else(|| Error::Internal("missing local node in network state".into()))?;
            local.distance = Some(0);
        }

        let mut queue: BinaryHeap<Reverse<(u32, Identifier)>> = BinaryHeap::new();
        queue.push(Reverse((0, self.local_id)));

        while let Some(Reverse((distance, id))) = queue.pop() {
            let (edges, next_hop) = match inner.vertices.get_mut(&id) {
                Some(vertex) => {
                    if std::mem::replace(&mut vertex.visited, true) {
                        continue;
                    }
                    (vertex.edges.clone(), vertex.next_hop)
                }
                None => continue,
            };

            for neighbor_id in edges {
                let Some(neighbor) = inner.vertices.get_mut(&neighbor_id) else {
                    continue; // dangling edge to an expired vertex
                };
                if neighbor.visited {
                    continue;
                }
                let tentative = distance + 1;
                if neighbor.next_hop.is_none() || neighbor.distance.map_or(true, |d| tentative < d)
                {
                    // The next hop seen from the local node; a direct
                    // neighbor routes to itself. First writer wins on ties.
                    neighbor.next_hop = Some(next_hop.unwrap_or(neighbor_id));
                    neighbor.distance = Some(tentative);
                    queue.push(Reverse((tentative, neighbor_id)));
                }
            }
        }

        let table = RoutingTable::from_entries(
            inner
                .vertices
                .iter()
                .filter_map(|(id, vertex)| vertex.next_hop.map(|next_hop| (*id, next_hop))),
        );
        debug!("Recomputed routing table, reachable={}", table.len());
        self.routing.set_table(Arc::new(table));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Dispatcher;

    fn graph_fixture() -> (Arc<Graph>, Arc<Routing>, Arc<SigningPair>) {
        let signing = Arc::new(SigningPair::generate());
        let dispatcher = Arc::new(Dispatcher::new());
        let routing = Routing::new(signing.id(), dispatcher);
        let scheduler = Arc::new(Scheduler::new());
        let graph = Graph::new(signing.clone(), PROVISION_NONE, routing.clone(), scheduler);
        (graph, routing, signing)
    }

    fn remote_state(
        pair: &SigningPair,
        sequence: u32,
        neighbors: impl IntoIterator<Item = Identifier>,
    ) -> State {
        let ecdh = EcdhPair::generate();
        let mut state = State::new(pair.id(), sequence, *ecdh.public());
        state.neighbors = neighbors.into_iter().collect();
        state
    }

    fn set_local_edges(graph: &Arc<Graph>, neighbors: impl IntoIterator<Item = Identifier>) {
        let neighbors: BTreeSet<Identifier> = neighbors.into_iter().collect();
        let mut inner = graph.inner.write();
        graph.update_edges(&mut inner, graph.local_id(), &neighbors).unwrap();
    }

    #[test]
    fn test_state_message_roundtrip() {
        let pair = SigningPair::generate();
        let neighbor = SigningPair::generate().id();
        let mut state = remote_state(&pair, 9, [neighbor]);
        state.provision = PROVISION_HAS_TURN;

        let message = state.to_message(&pair).unwrap();
        let wire = message.encode().unwrap();
        let decoded = State::from_message(&Message::decode(&wire).unwrap()).unwrap();
        assert_eq!(decoded.id, pair.id());
        assert_eq!(decoded.sequence, 9);
        assert_eq!(decoded.provision, PROVISION_HAS_TURN);
        assert_eq!(decoded.ecdh_public, state.ecdh_public);
        assert_eq!(decoded.neighbors, state.neighbors);
    }

    #[test]
    fn test_insert_enforces_monotonic_sequences() {
        let (graph, _, _) = graph_fixture();
        let remote = SigningPair::generate();

        assert!(graph.insert(remote_state(&remote, 5, [])));
        assert!(!graph.insert(remote_state(&remote, 5, [])));
        assert!(!graph.insert(remote_state(&remote, 4, [])));
        assert!(graph.insert(remote_state(&remote, 6, [])));
        assert_eq!(graph.get(&remote.id()).unwrap().sequence, 6);

        // Wrap-around still counts as newer.
        let wrapping = SigningPair::generate();
        assert!(graph.insert(remote_state(&wrapping, 0xFFFF_FFFF, [])));
        assert!(graph.insert(remote_state(&wrapping, 0, [])));
    }

    #[test]
    fn test_get_unknown_peer() {
        let (graph, _, _) = graph_fixture();
        let stranger = SigningPair::generate().id();
        assert!(matches!(graph.get(&stranger), Err(Error::UnknownPeer)));
    }

    #[test]
    fn test_chain_routing_table() {
        let (graph, routing, signing) = graph_fixture();
        let b = SigningPair::generate();
        let c = SigningPair::generate();

        // local -- b -- c
        graph.insert(remote_state(&b, 1, [signing.id(), c.id()]));
        graph.insert(remote_state(&c, 1, [b.id()]));
        set_local_edges(&graph, [b.id()]);

        let table = routing.table();
        assert_eq!(table.next_hop(&b.id()), Some(b.id()));
        assert_eq!(table.next_hop(&c.id()), Some(b.id()));
        assert_eq!(table.next_hop(&signing.id()), None);
    }

    #[test]
    fn test_unreachable_vertex_not_in_table() {
        let (graph, routing, signing) = graph_fixture();
        let b = SigningPair::generate();
        let island = SigningPair::generate();

        graph.insert(remote_state(&b, 1, [signing.id()]));
        graph.insert(remote_state(&island, 1, []));
        set_local_edges(&graph, [b.id()]);

        let table = routing.table();
        assert_eq!(table.next_hop(&b.id()), Some(b.id()));
        assert_eq!(table.next_hop(&island.id()), None);
    }

    #[test]
    fn test_diamond_next_hop_is_direct_neighbor() {
        let (graph, routing, signing) = graph_fixture();
        let b = SigningPair::generate();
        let c = SigningPair::generate();
        let d = SigningPair::generate();

        // local -- {b, c} -- d
        graph.insert(remote_state(&b, 1, [signing.id(), d.id()]));
        graph.insert(remote_state(&c, 1, [signing.id(), d.id()]));
        graph.insert(remote_state(&d, 1, [b.id(), c.id()]));
        set_local_edges(&graph, [b.id(), c.id()]);

        let table = routing.table();
        let via = table.next_hop(&d.id()).unwrap();
        assert!(via == b.id() || via == c.id());
    }

    #[test]
    fn test_removed_edge_drops_route() {
        let (graph, routing, signing) = graph_fixture();
        let b = SigningPair::generate();

        graph.insert(remote_state(&b, 1, [signing.id()]));
        set_local_edges(&graph, [b.id()]);
        assert_eq!(routing.table().next_hop(&b.id()), Some(b.id()));

        set_local_edges(&graph, []);
        assert_eq!(routing.table().next_hop(&b.id()), None);
    }

    #[test]
    fn test_nodes_filters_on_provision() {
        let (graph, _, _) = graph_fixture();
        let plain = SigningPair::generate();
        let relay = SigningPair::generate();

        graph.insert(remote_state(&plain, 1, []));
        let mut state = remote_state(&relay, 1, []);
        state.provision = PROVISION_HAS_TURN | PROVISION_HAS_WEBSOCKET;
        graph.insert(state);

        let relays = graph.nodes(PROVISION_HAS_TURN);
        assert_eq!(relays, vec![relay.id()]);
        // The local seed and both remotes match an empty requirement.
        assert_eq!(graph.nodes(PROVISION_NONE).len(), 3);
    }

    #[test]
    fn test_vertex_expiry() {
        let (graph, _, _) = graph_fixture();
        let remote = SigningPair::generate();
        graph.insert(remote_state(&remote, 1, []));
        assert!(graph.get(&remote.id()).is_ok());

        for _ in 0..VERTEX_EXPIRY_TICKS {
            graph.update();
        }
        assert!(graph.get(&remote.id()).is_ok());
        graph.update();
        assert!(matches!(graph.get(&remote.id()), Err(Error::UnknownPeer)));
        // The local vertex never expires.
        assert!(graph.get(&graph.local_id()).is_ok());
    }
}
