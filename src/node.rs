//! Public node API
//!
//! A `Node` assembles the whole overlay core: routing fabric, topology
//! engine, provisioning, peering and the user message lane. It is driven
//! by periodic `update` ticks (200 ms reference cadence) from the caller.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::crypto::{Identifier, SigningPair};
use crate::error::{Error, Result};
use crate::events::Dispatcher;
use crate::graph::{Graph, PROVISION_HAS_TURN, PROVISION_HAS_WEBSOCKET, PROVISION_NONE};
use crate::message::MessageType;
use crate::peering::{Connector, Networking, NullConnector};
use crate::provisioning::Provisioning;
use crate::routing::Routing;
use crate::scheduler::Scheduler;
use crate::server::{self, Server, TcpConnector};
use crate::transport::Transport;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DUMMY_TLS_SERVICE: &str = "legio-p2p.net";
/// Default relay port vended to peers when none is configured.
const DEFAULT_RELAY_PORT: u16 = 3478;

/// Node configuration; every field is optional.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Listening port; `None` disables the listener.
    pub port: Option<u16>,
    /// Publicly reachable host, advertised to peers. Setting it also marks
    /// this node as a relay operator.
    pub external_host: Option<String>,
    pub external_port: Option<u16>,
    pub tls_pem_certificate: Option<String>,
    pub tls_pem_key: Option<String>,
    pub dummy_tls_service: Option<String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            port: Some(DEFAULT_PORT),
            external_host: None,
            external_port: None,
            tls_pem_certificate: None,
            tls_pem_key: None,
            dummy_tls_service: Some(DEFAULT_DUMMY_TLS_SERVICE.to_string()),
        }
    }
}

impl Configuration {
    fn validate(&self) -> Result<()> {
        if self.tls_pem_certificate.is_some() != self.tls_pem_key.is_some() {
            return Err(Error::Config(
                "TLS certificate and key must be provided together".into(),
            ));
        }
        if self.external_port.is_some() && self.external_host.is_none() {
            return Err(Error::Config("external port without external host".into()));
        }
        Ok(())
    }
}

pub type MessageCallback = Box<dyn Fn(Identifier, Vec<u8>) + Send + Sync>;

pub struct Node {
    config: Configuration,
    signing: Arc<SigningPair>,
    scheduler: Arc<Scheduler>,
    routing: Arc<Routing>,
    graph: Arc<Graph>,
    provisioning: Arc<Provisioning>,
    networking: Arc<Networking>,
    server: Option<Arc<Server>>,
    user_transport: Arc<Transport>,
    message_callback: Arc<RwLock<Option<MessageCallback>>>,
}

impl Node {
    /// Creates a node with the default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(Configuration::default())
    }

    /// Creates a node. A listening port requires a tokio runtime; without
    /// one, leave `port` unset and attach channels explicitly.
    pub fn new(config: Configuration) -> Result<Self> {
        Self::build(config, None)
    }

    /// Creates a node with a custom direct-connection collaborator.
    pub fn with_connector(config: Configuration, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::build(config, Some(connector))
    }

    fn build(config: Configuration, connector: Option<Arc<dyn Connector>>) -> Result<Self> {
        config.validate()?;
        if config.tls_pem_certificate.is_some() {
            warn!("TLS material configured but the plain listener does not terminate TLS");
        }

        let signing = Arc::new(SigningPair::generate());
        let dispatcher = Arc::new(Dispatcher::new());
        let scheduler = Arc::new(Scheduler::new());
        let routing = Routing::new(signing.id(), dispatcher.clone());

        let server = match config.port {
            Some(port) => {
                let external = config
                    .external_host
                    .clone()
                    .map(|host| (host, config.external_port.unwrap_or(port)));
                Some(Server::bind(port, external, routing.clone())?)
            }
            None => None,
        };

        let mut provision = PROVISION_NONE;
        if server.is_some() {
            provision |= PROVISION_HAS_WEBSOCKET;
        }
        let relay_host = config
            .external_host
            .clone()
            .map(|host| format!("{}:{}", host, config.external_port.unwrap_or(DEFAULT_RELAY_PORT)));
        if relay_host.is_some() {
            provision |= PROVISION_HAS_TURN;
        }

        let graph = Graph::new(signing.clone(), provision, routing.clone(), scheduler.clone());
        let provisioning =
            Provisioning::new(graph.clone(), routing.clone(), signing.clone(), relay_host);

        let connector: Arc<dyn Connector> = match connector {
            Some(connector) => connector,
            None => {
                let endpoint = server.as_ref().map(|server| server.endpoint());
                match TcpConnector::new(endpoint) {
                    Ok(connector) => connector,
                    Err(e) if config.port.is_none() => {
                        debug!("Direct peering disabled: {}", e);
                        Arc::new(NullConnector)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let networking = Networking::new(
            graph.clone(),
            routing.clone(),
            signing.clone(),
            provisioning.clone(),
            connector,
        );

        let message_callback: Arc<RwLock<Option<MessageCallback>>> = Arc::new(RwLock::new(None));
        let user_transport = {
            let holder = message_callback.clone();
            Transport::broadcastable(
                MessageType::User,
                graph.clone(),
                routing.clone(),
                signing.clone(),
                Box::new(move |remote_id, payload| {
                    let callback = holder.read();
                    if let Some(callback) = callback.as_ref() {
                        callback(remote_id, payload);
                    }
                }),
            )
        };

        // Event wiring, in attachment order.
        {
            let graph = Arc::downgrade(&graph);
            dispatcher.subscribe(Box::new(move |event| {
                if let Some(graph) = graph.upgrade() {
                    graph.handle_event(event);
                }
            }));
        }
        for transport in [&user_transport, networking.transport(), provisioning.transport()] {
            let transport = Arc::downgrade(transport);
            dispatcher.subscribe(Box::new(move |event| {
                if let Some(transport) = transport.upgrade() {
                    transport.handle_event(event);
                }
            }));
        }

        Ok(Self {
            config,
            signing,
            scheduler,
            routing,
            graph,
            provisioning,
            networking,
            server,
            user_transport,
            message_callback,
        })
    }

    /// The local identifier.
    pub fn id(&self) -> Identifier {
        self.signing.id()
    }

    /// Whether at least one destination is currently routable.
    pub fn is_connected(&self) -> bool {
        !self.routing.table().is_empty()
    }

    /// The bootstrap URL of the listening server, when there is one.
    pub fn url(&self) -> Option<String> {
        self.server.as_ref().map(|server| server.url())
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    /// One tick; call periodically (reference cadence 200 ms).
    pub fn update(&self) {
        self.graph.update();
        self.provisioning.update();
        self.networking.update();
        self.scheduler.run();
    }

    /// Bootstraps to a server URL (`ws:`/`wss:`) or initiates direct
    /// peering with a base64url-encoded identifier.
    pub fn connect(&self, url: &str) -> Result<()> {
        if url.starts_with("ws:") || url.starts_with("wss:") {
            server::connect_url(self.routing.clone(), url)
        } else {
            let remote_id = Identifier::from_base64url(url)?;
            self.networking.connect_peer(remote_id);
            Ok(())
        }
    }

    /// Registers an externally established channel (inbound delivery may
    /// begin immediately).
    pub fn attach(&self, channel: Arc<dyn Channel>) {
        self.routing.add_channel(channel);
    }

    /// Sends an end-to-end encrypted unicast message.
    pub fn send(&self, id: &[u8], message: &[u8]) -> Result<()> {
        let remote_id = Identifier::from_bytes(id)?;
        self.user_transport.send(remote_id, message)
    }

    /// Broadcasts an authenticated (unencrypted) message to every
    /// reachable node.
    pub fn broadcast(&self, message: &[u8]) -> Result<()> {
        self.user_transport.broadcast(message)
    }

    /// Installs the user receive callback.
    pub fn on_message(&self, callback: impl Fn(Identifier, Vec<u8>) + Send + Sync + 'static) {
        *self.message_callback.write() = Some(Box::new(callback));
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("connected", &self.is_connected())
            .field("vertices", &self.graph.count())
            .field("provisioned", &self.provisioning.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_defaults() {
        let config = Configuration::default();
        assert_eq!(config.port, Some(DEFAULT_PORT));
        assert_eq!(config.dummy_tls_service.as_deref(), Some(DEFAULT_DUMMY_TLS_SERVICE));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_configuration_rejects_half_tls() {
        let config = Configuration {
            tls_pem_certificate: Some("cert".into()),
            ..Configuration::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_unlistening_node_without_runtime() {
        let config = Configuration { port: None, ..Configuration::default() };
        let node = Node::new(config).unwrap();
        assert!(!node.is_connected());
        assert!(node.url().is_none());
        node.update();
    }

    #[test]
    fn test_connect_rejects_bad_identifier() {
        let config = Configuration { port: None, ..Configuration::default() };
        let node = Node::new(config).unwrap();
        assert!(node.connect("not-an-identifier").is_err());
    }
}
