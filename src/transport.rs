//! Typed message lanes over the routing fabric
//!
//! A transport owns one message type and a receive callback. Unicast
//! payloads are sealed against the recipient's advertised key-agreement
//! key; broadcastable lanes additionally flood signed plaintext payloads.
//! Either way receivers enforce a strictly increasing per-source sequence,
//! so replays and re-floods die here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::crypto::{Identifier, SigningPair};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::graph::Graph;
use crate::message::{sequence_newer, CipherBody, Message, MessageType};
use crate::routing::Routing;

pub type ReceiveCallback = Box<dyn Fn(Identifier, Vec<u8>) + Send + Sync>;

pub struct Transport {
    kind: MessageType,
    broadcastable: bool,
    graph: Arc<Graph>,
    routing: Arc<Routing>,
    signing: Arc<SigningPair>,
    receive_callback: ReceiveCallback,
    send_sequence: AtomicU32,
    sequences: Mutex<HashMap<Identifier, u32>>,
}

impl Transport {
    /// A plain unicast-only lane.
    pub fn new(
        kind: MessageType,
        graph: Arc<Graph>,
        routing: Arc<Routing>,
        signing: Arc<SigningPair>,
        receive_callback: ReceiveCallback,
    ) -> Arc<Self> {
        Self::build(kind, false, graph, routing, signing, receive_callback)
    }

    /// A lane that additionally supports authenticated flooding.
    pub fn broadcastable(
        kind: MessageType,
        graph: Arc<Graph>,
        routing: Arc<Routing>,
        signing: Arc<SigningPair>,
        receive_callback: ReceiveCallback,
    ) -> Arc<Self> {
        Self::build(kind, true, graph, routing, signing, receive_callback)
    }

    fn build(
        kind: MessageType,
        broadcastable: bool,
        graph: Arc<Graph>,
        routing: Arc<Routing>,
        signing: Arc<SigningPair>,
        receive_callback: ReceiveCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            broadcastable,
            graph,
            routing,
            signing,
            receive_callback,
            send_sequence: AtomicU32::new(0),
            sequences: Mutex::new(HashMap::new()),
        })
    }

    /// Seals `payload` for `remote_id` and hands it to routing. Fails with
    /// `UnknownPeer` when no State is cached for the recipient.
    pub fn send(&self, remote_id: Identifier, payload: &[u8]) -> Result<()> {
        let remote_state = self.graph.get(&remote_id)?;
        let cipher = CipherBody::encrypt(payload, self.graph.local_ecdh(), &remote_state.ecdh_public)?;
        let sequence = self.send_sequence.fetch_add(1, Ordering::Relaxed);
        let message = Message::signed(
            self.kind,
            sequence,
            cipher.encode(),
            &self.signing,
            Some(remote_id),
        )?;
        self.routing.send(message);
        Ok(())
    }

    /// Floods `payload`, signed but not encrypted, to the whole overlay.
    pub fn broadcast(&self, payload: &[u8]) -> Result<()> {
        if !self.broadcastable {
            return Err(Error::Internal("transport does not support broadcasting".into()));
        }
        let sequence = self.send_sequence.fetch_add(1, Ordering::Relaxed);
        let message =
            Message::signed(self.kind, sequence, payload.to_vec(), &self.signing, None)?;
        self.routing.broadcast(&message, None);
        Ok(())
    }

    /// Routing event entry point; ignores events for other lanes.
    pub fn handle_event(&self, event: &Event) {
        let Event::Message { message, channel } = event else { return };
        if message.kind != self.kind || message.source.is_none() {
            return;
        }
        self.incoming(message, channel.as_ref());
    }

    fn incoming(&self, message: &Arc<Message>, from: Option<&Arc<dyn Channel>>) {
        let Some(source) = message.source else { return };
        if source == self.signing.id() {
            return; // own traffic echoed back around a cycle
        }

        if !self.check_sequence(source, message.sequence) {
            trace!("Dropping stale frame from {}", source);
            return;
        }

        match message.destination {
            Some(_) => {
                let cipher = match CipherBody::decode(&message.body) {
                    Ok(cipher) => cipher,
                    Err(e) => {
                        debug!("Dropping undecodable body from {}: {}", source, e);
                        return;
                    }
                };
                match cipher.decrypt(self.graph.local_ecdh()) {
                    Ok(payload) => (self.receive_callback)(source, payload),
                    Err(e) => debug!("Dropping unopenable body from {}: {}", source, e),
                }
            }
            None => {
                if !self.broadcastable {
                    return; // no broadcast on a plain lane
                }
                // Re-flood before local delivery; sequence checks at every
                // hop terminate the flood.
                self.routing.broadcast(message, from.map(|c| c.id()));
                (self.receive_callback)(source, message.body.clone());
            }
        }
    }

    /// Accepts a frame iff its sequence is serially newer than the last
    /// accepted one for this source; a first frame always passes.
    fn check_sequence(&self, id: Identifier, sequence: u32) -> bool {
        let mut sequences = self.sequences.lock();
        match sequences.get_mut(&id) {
            None => {
                sequences.insert(id, sequence);
                true
            }
            Some(last) => {
                if sequence_newer(sequence, *last) {
                    *last = sequence;
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Dispatcher;
    use crate::graph::PROVISION_NONE;
    use crate::scheduler::Scheduler;

    fn transport_fixture(broadcastable: bool) -> Arc<Transport> {
        let signing = Arc::new(SigningPair::generate());
        let dispatcher = Arc::new(Dispatcher::new());
        let routing = Routing::new(signing.id(), dispatcher);
        let scheduler = Arc::new(Scheduler::new());
        let graph = Graph::new(signing.clone(), PROVISION_NONE, routing.clone(), scheduler);
        if broadcastable {
            Transport::broadcastable(MessageType::User, graph, routing, signing, Box::new(|_, _| {}))
        } else {
            Transport::new(MessageType::User, graph, routing, signing, Box::new(|_, _| {}))
        }
    }

    #[test]
    fn test_check_sequence_discipline() {
        let transport = transport_fixture(false);
        let id = SigningPair::generate().id();

        assert!(transport.check_sequence(id, 10));
        assert!(!transport.check_sequence(id, 10));
        assert!(!transport.check_sequence(id, 9));
        assert!(transport.check_sequence(id, 11));

        // Wrap-around continues the sequence.
        let other = SigningPair::generate().id();
        assert!(transport.check_sequence(other, 0xFFFF_FFFF));
        assert!(transport.check_sequence(other, 0));
    }

    #[test]
    fn test_send_to_unknown_peer() {
        let transport = transport_fixture(false);
        let stranger = SigningPair::generate().id();
        assert!(matches!(transport.send(stranger, b"hi"), Err(Error::UnknownPeer)));
    }

    #[test]
    fn test_plain_transport_refuses_broadcast() {
        let transport = transport_fixture(false);
        assert!(transport.broadcast(b"flood").is_err());
        let broadcastable = transport_fixture(true);
        assert!(broadcastable.broadcast(b"flood").is_ok());
    }
}
