//! Routing fabric: channels, neighbor bindings and message forwarding
//!
//! The fabric owns every open channel and the subset bound to a neighbor
//! identity. Inbound frames are decoded and verified here, then either
//! delivered upstream as an event, forwarded along the next hop, or
//! dropped. The routing table is an immutable snapshot swapped in whole by
//! the graph engine, so readers never block on a recomputation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::crypto::Identifier;
use crate::events::{Dispatcher, Event};
use crate::message::Message;

/// Snapshot mapping each reachable destination to the neighbor to forward
/// through. Never mutated in place.
#[derive(Default)]
pub struct RoutingTable {
    next_hops: HashMap<Identifier, Identifier>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (Identifier, Identifier)>) -> Self {
        Self { next_hops: entries.into_iter().collect() }
    }

    pub fn next_hop(&self, destination: &Identifier) -> Option<Identifier> {
        self.next_hops.get(destination).copied()
    }

    /// Identifiers of every reachable destination.
    pub fn nodes(&self) -> Vec<Identifier> {
        self.next_hops.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.next_hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next_hops.is_empty()
    }
}

pub struct Routing {
    local_id: Identifier,
    dispatcher: Arc<Dispatcher>,
    table: RwLock<Arc<RoutingTable>>,
    channels: RwLock<HashMap<u64, Arc<dyn Channel>>>,
    neighbors: RwLock<HashMap<Identifier, Arc<dyn Channel>>>,
}

impl Routing {
    pub fn new(local_id: Identifier, dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            dispatcher,
            table: RwLock::new(Arc::new(RoutingTable::new())),
            channels: RwLock::new(HashMap::new()),
            neighbors: RwLock::new(HashMap::new()),
        })
    }

    pub fn local_id(&self) -> Identifier {
        self.local_id
    }

    /// Registers a channel and installs its inbound and close callbacks.
    /// Every decodable frame arriving on it is routed; parse and signature
    /// failures are logged and dropped.
    pub fn add_channel(self: &Arc<Self>, channel: Arc<dyn Channel>) {
        let weak = Arc::downgrade(self);
        let weak_channel = Arc::downgrade(&channel);
        channel.on_frame(Some(Arc::new(move |frame: &[u8]| {
            // May run on any thread the channel implementation uses.
            let Some(routing) = weak.upgrade() else { return };
            let from = weak_channel.upgrade();
            match Message::decode(frame) {
                Ok(message) => routing.route(Arc::new(message), from),
                Err(e) => debug!("Dropping invalid frame: {}", e),
            }
        })));

        let weak = Arc::downgrade(self);
        let weak_channel = Arc::downgrade(&channel);
        channel.on_close(Some(Arc::new(move || {
            if let (Some(routing), Some(channel)) = (weak.upgrade(), weak_channel.upgrade()) {
                routing.remove_channel(&channel);
            }
        })));

        self.channels.write().insert(channel.id(), channel);
    }

    /// Unregisters a channel and evicts every neighbor binding that used
    /// it, raising a departure event per evicted neighbor.
    pub fn remove_channel(&self, channel: &Arc<dyn Channel>) {
        let removed = self.channels.write().remove(&channel.id());
        if let Some(removed) = removed {
            removed.on_frame(None);
            removed.on_close(None);
        }

        let departed: Vec<Identifier> = {
            let mut neighbors = self.neighbors.write();
            let ids: Vec<Identifier> = neighbors
                .iter()
                .filter(|(_, bound)| bound.id() == channel.id())
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                neighbors.remove(id);
            }
            ids
        };

        for id in departed {
            debug!("Neighbor {} went away with its channel", id);
            self.dispatcher.dispatch(&Event::Neighbor { id, channel: None });
        }
    }

    /// Binds `remote_id` to a registered channel. A given identifier holds
    /// at most one binding; rebinding attempts are ignored.
    pub fn add_neighbor(&self, remote_id: Identifier, channel: Arc<dyn Channel>) {
        let inserted = {
            let channels = self.channels.read();
            if !channels.contains_key(&channel.id()) {
                false
            } else {
                let mut neighbors = self.neighbors.write();
                if neighbors.contains_key(&remote_id) {
                    false
                } else {
                    neighbors.insert(remote_id, channel.clone());
                    true
                }
            }
        };

        if inserted {
            self.dispatcher.dispatch(&Event::Neighbor { id: remote_id, channel: Some(channel) });
        }
    }

    /// Removes the binding for `remote_id` if it is held by `channel`.
    pub fn remove_neighbor(&self, remote_id: Identifier, channel: &Arc<dyn Channel>) {
        let removed = {
            let mut neighbors = self.neighbors.write();
            match neighbors.get(&remote_id) {
                Some(bound) if bound.id() == channel.id() => {
                    neighbors.remove(&remote_id);
                    true
                }
                _ => false,
            }
        };

        if removed {
            self.dispatcher.dispatch(&Event::Neighbor { id: remote_id, channel: None });
        }
    }

    pub fn has_neighbor(&self, remote_id: &Identifier) -> bool {
        self.neighbors.read().contains_key(remote_id)
    }

    pub fn neighbors(&self) -> BTreeSet<Identifier> {
        self.neighbors.read().keys().copied().collect()
    }

    pub fn table(&self) -> Arc<RoutingTable> {
        self.table.read().clone()
    }

    /// Atomically replaces the routing table snapshot.
    pub fn set_table(&self, table: Arc<RoutingTable>) {
        *self.table.write() = table;
    }

    /// Sends a locally originated message: routed when it carries a
    /// destination, flooded otherwise.
    pub fn send(&self, message: Message) {
        if message.destination.is_some() {
            self.route(Arc::new(message), None);
        } else {
            self.broadcast(&message, None);
        }
    }

    /// Serializes once and sends on every open channel except `from`.
    /// Per-channel failures are logged and do not abort the flood.
    pub fn broadcast(&self, message: &Message, from: Option<u64>) {
        let wire = match message.encode() {
            Ok(wire) => wire,
            Err(e) => {
                warn!("Cannot encode broadcast: {}", e);
                return;
            }
        };

        let targets: Vec<Arc<dyn Channel>> = {
            let channels = self.channels.read();
            channels
                .values()
                .filter(|c| Some(c.id()) != from && c.is_open())
                .cloned()
                .collect()
        };

        for channel in targets {
            if let Err(e) = channel.send(&wire) {
                warn!("Broadcast send failed on channel {}: {}", channel.id(), e);
            }
        }
    }

    /// Decides the fate of a message: deliver upstream when it is a
    /// broadcast or addressed to this node, forward along the next hop
    /// otherwise. Undeliverable messages are dropped.
    fn route(&self, message: Arc<Message>, from: Option<Arc<dyn Channel>>) {
        if message.source.is_none() {
            debug!("Dropping message without source");
            return;
        }

        let destination = match message.destination {
            None => {
                self.dispatcher.dispatch(&Event::Message { message, channel: from });
                return;
            }
            Some(destination) if destination == self.local_id => {
                self.dispatcher.dispatch(&Event::Message { message, channel: from });
                return;
            }
            Some(destination) => destination,
        };

        let channel = {
            let table = self.table.read();
            match table.next_hop(&destination) {
                Some(next_hop) => self.neighbors.read().get(&next_hop).cloned(),
                None => None,
            }
        };

        match channel {
            Some(channel) => {
                let wire = match message.encode() {
                    Ok(wire) => wire,
                    Err(e) => {
                        warn!("Cannot encode message for forwarding: {}", e);
                        return;
                    }
                };
                if let Err(e) = channel.send(&wire) {
                    warn!("Forward to {} failed: {}", destination, e);
                }
            }
            None => trace!("No route towards {}, dropping", destination),
        }
    }
}
