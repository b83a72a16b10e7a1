//! Direct-channel establishment between overlay peers
//!
//! A `Peering` drives one direct-connection attempt towards a target peer:
//! it gathers relay URLs from provisioning, exchanges `{type, sdp}`
//! description blobs over the signaling lane and promotes the resulting
//! channel to a neighbor binding. Connection establishment itself sits
//! behind the `Connector` trait; implementations decide what a description
//! means (the TCP connector advertises its listening endpoint).
//!
//! Simultaneous dials resolve deterministically: a node holding an
//! outstanding local offer drops an incoming offer iff its identifier is
//! the larger one.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::thread_rng;
use tracing::{debug, info, warn};

use crate::binary::{pack_strings, unpack_strings};
use crate::channel::Channel;
use crate::crypto::{Identifier, SigningPair};
use crate::error::Result;
use crate::graph::Graph;
use crate::message::MessageType;
use crate::provisioning::Provisioning;
use crate::routing::Routing;
use crate::transport::Transport;

pub const DESCRIPTION_OFFER: &str = "offer";
pub const DESCRIPTION_ANSWER: &str = "answer";

/// Keep this many direct peerings established.
const TARGET_PEERING_COUNT: usize = 4;
/// Relay URLs handed to each connection attempt.
const RELAYS_PER_ATTEMPT: usize = 2;

/// An SDP-style description blob exchanged over the signaling lane.
#[derive(Debug, Clone)]
pub struct Description {
    pub kind: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
}

/// Callbacks a connection raises back into its peering.
pub trait ConnectionHandler: Send + Sync {
    fn on_local_description(&self, description: Description);
    fn on_channel(&self, channel: Arc<dyn Channel>);
}

/// One connection attempt owned by a peering.
pub trait Connection: Send + Sync {
    /// Starts the exchange; emits a local offer description.
    fn offer(&self);
    fn apply_remote_description(&self, description: Description) -> Result<()>;
    fn signaling_state(&self) -> SignalingState;
    fn close(&self);
}

/// External collaborator producing direct channels.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        remote_id: &Identifier,
        relays: Vec<String>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<dyn Connection>;
}

/// Connector used when no real one is available (no runtime, no
/// listener); every attempt fails loudly but harmlessly.
pub struct NullConnector;

impl Connector for NullConnector {
    fn open(
        &self,
        remote_id: &Identifier,
        _relays: Vec<String>,
        _handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<dyn Connection> {
        warn!("No connector available for peering with {}", remote_id);
        Arc::new(NullConnection)
    }
}

struct NullConnection;

impl Connection for NullConnection {
    fn offer(&self) {}

    fn apply_remote_description(&self, _description: Description) -> Result<()> {
        Err(crate::error::Error::Internal("no connector available".into()))
    }

    fn signaling_state(&self) -> SignalingState {
        SignalingState::Stable
    }

    fn close(&self) {}
}

/// Per-target direct-connection state machine.
pub struct Peering {
    remote_id: Identifier,
    local_id: Identifier,
    routing: Arc<Routing>,
    transport: Arc<Transport>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
}

impl Peering {
    fn new(
        remote_id: Identifier,
        local_id: Identifier,
        routing: Arc<Routing>,
        transport: Arc<Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote_id,
            local_id,
            routing,
            transport,
            connection: Mutex::new(None),
            channel: Mutex::new(None),
        })
    }

    pub fn remote_id(&self) -> Identifier {
        self.remote_id
    }

    pub fn is_connected(&self) -> bool {
        self.channel.lock().as_ref().map_or(false, |channel| channel.is_open())
    }

    fn ensure_connection(
        self: &Arc<Self>,
        connector: &Arc<dyn Connector>,
        relays: Vec<String>,
    ) -> Arc<dyn Connection> {
        let mut connection = self.connection.lock();
        if let Some(connection) = connection.as_ref() {
            return connection.clone();
        }
        let handler: Arc<dyn ConnectionHandler> = self.clone();
        let created = connector.open(&self.remote_id, relays, handler);
        *connection = Some(created.clone());
        created
    }

    /// Initiates the exchange towards the remote peer.
    pub fn connect(self: &Arc<Self>, connector: &Arc<dyn Connector>, relays: Vec<String>) {
        let connection = self.ensure_connection(connector, relays);
        connection.offer();
    }

    /// Feeds a remote description received over the signaling lane.
    pub fn receive(
        self: &Arc<Self>,
        connector: &Arc<dyn Connector>,
        relays: Vec<String>,
        payload: &[u8],
    ) {
        let description = match unpack_strings(payload, 2) {
            Ok(strings) => {
                let [kind, content] = match <[String; 2]>::try_from(strings) {
                    Ok(parts) => parts,
                    Err(_) => return,
                };
                Description { kind, content }
            }
            Err(e) => {
                debug!("Dropping malformed signaling payload from {}: {}", self.remote_id, e);
                return;
            }
        };
        debug!("Remote description from {}, type={}", self.remote_id, description.kind);

        let connection = self.ensure_connection(connector, relays);
        if description.kind == DESCRIPTION_OFFER
            && connection.signaling_state() == SignalingState::HaveLocalOffer
            && self.local_id > self.remote_id
        {
            // Offer collision: the larger identifier keeps its own offer.
            debug!("Ignoring colliding offer from {}", self.remote_id);
            return;
        }

        if let Err(e) = connection.apply_remote_description(description) {
            debug!("Cannot apply description from {}: {}", self.remote_id, e);
        }
    }

    pub fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().take() {
            connection.close();
        }
        if let Some(channel) = self.channel.lock().take() {
            self.routing.remove_channel(&channel);
            channel.close();
        }
    }
}

impl Drop for Peering {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl ConnectionHandler for Peering {
    fn on_local_description(&self, description: Description) {
        debug!("Local description for {}, type={}", self.remote_id, description.kind);
        let payload = pack_strings(&[description.kind.as_str(), description.content.as_str()]);
        if let Err(e) = self.transport.send(self.remote_id, &payload) {
            warn!("Cannot signal {}: {}", self.remote_id, e);
        }
    }

    fn on_channel(&self, channel: Arc<dyn Channel>) {
        info!("Direct channel to {} open", self.remote_id);
        *self.channel.lock() = Some(channel.clone());
        self.routing.add_channel(channel.clone());
        self.routing.add_neighbor(self.remote_id, channel);
    }
}

/// Owns the signaling lane and all peerings; tops the set up to the
/// target count from random routable peers on every tick.
pub struct Networking {
    local_id: Identifier,
    routing: Arc<Routing>,
    provisioning: Arc<Provisioning>,
    connector: Arc<dyn Connector>,
    transport: Arc<Transport>,
    peerings: Mutex<HashMap<Identifier, Arc<Peering>>>,
}

impl Networking {
    pub fn new(
        graph: Arc<Graph>,
        routing: Arc<Routing>,
        signing: Arc<SigningPair>,
        provisioning: Arc<Provisioning>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Networking>| {
            let callback = {
                let weak = weak.clone();
                Box::new(move |remote_id: Identifier, payload: Vec<u8>| {
                    if let Some(networking) = weak.upgrade() {
                        networking.receive(remote_id, &payload);
                    }
                })
            };
            let transport =
                Transport::new(MessageType::Signaling, graph, routing.clone(), signing, callback);
            Self {
                local_id: routing.local_id(),
                routing,
                provisioning,
                connector,
                transport,
                peerings: Mutex::new(HashMap::new()),
            }
        })
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.peerings.lock().values().any(|peering| peering.is_connected())
    }

    /// One node tick: when below the target, start a peering towards a
    /// random reachable node not yet tried.
    pub fn update(&self) {
        let known: Vec<Identifier> = {
            let peerings = self.peerings.lock();
            if peerings.len() >= TARGET_PEERING_COUNT {
                return;
            }
            peerings.keys().copied().collect()
        };

        let mut nodes = self.routing.table().nodes();
        nodes.shuffle(&mut thread_rng());
        for id in nodes {
            if id == self.local_id || known.contains(&id) || self.routing.has_neighbor(&id) {
                continue;
            }
            debug!("Starting peering towards {}", id);
            self.connect_peer(id);
            break;
        }
    }

    /// Initiates a direct peering towards `remote_id`.
    pub fn connect_peer(&self, remote_id: Identifier) {
        let peering = self.peering(remote_id);
        peering.connect(&self.connector, self.relay_urls());
    }

    fn receive(&self, remote_id: Identifier, payload: &[u8]) {
        let peering = self.peering(remote_id);
        peering.receive(&self.connector, self.relay_urls(), payload);
    }

    fn peering(&self, remote_id: Identifier) -> Arc<Peering> {
        let mut peerings = self.peerings.lock();
        peerings
            .entry(remote_id)
            .or_insert_with(|| {
                debug!("Creating peering for {}", remote_id);
                Peering::new(
                    remote_id,
                    self.local_id,
                    self.routing.clone(),
                    self.transport.clone(),
                )
            })
            .clone()
    }

    fn relay_urls(&self) -> Vec<String> {
        self.provisioning
            .pick(RELAYS_PER_ATTEMPT)
            .into_iter()
            .map(|entry| entry.url())
            .collect()
    }
}
