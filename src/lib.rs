//! Legio: a self-healing peer-to-peer routed overlay
//!
//! Each node is identified by its signing public key, keeps a handful of
//! direct neighbors, learns the topology through flooded state
//! advertisements and routes authenticated, end-to-end encrypted messages
//! along shortest paths. See [`Node`] for the public surface.

pub mod binary;
pub mod channel;
pub mod crypto;
pub mod error;
pub mod events;
pub mod graph;
pub mod message;
pub mod node;
pub mod peering;
pub mod provisioning;
pub mod routing;
pub mod scheduler;
pub mod server;
pub mod transport;

// Re-exports
pub use binary::{from_base64url, from_hex, to_base64url, to_hex};
pub use channel::{memory_pair, Channel, MemoryChannel};
pub use crypto::{Identifier, IDENTIFIER_SIZE};
pub use error::{Error, Result};
pub use graph::{State, PROVISION_HAS_TURN, PROVISION_HAS_WEBSOCKET};
pub use message::{compare_sequence, Message, MessageType};
pub use node::{Configuration, Node, DEFAULT_PORT};
pub use peering::{Connection, ConnectionHandler, Connector, Description, SignalingState};
pub use routing::RoutingTable;
pub use scheduler::Scheduler;
