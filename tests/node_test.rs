//! End-to-end overlay scenarios over in-process channels
//!
//! Nodes are driven tick by tick and wired with synchronous in-memory
//! channels, so every scenario is deterministic. Direct peering is
//! exercised through a loopback connector defined here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use legio::channel::{memory_pair, Channel, CloseCallback, FrameCallback};
use legio::crypto::Identifier;
use legio::error::Result;
use legio::node::{Configuration, Node};
use legio::peering::{
    Connection, ConnectionHandler, Connector, Description, SignalingState, DESCRIPTION_ANSWER,
    DESCRIPTION_OFFER,
};

fn unlistening_node() -> Node {
    let config = Configuration { port: None, ..Configuration::default() };
    Node::new(config).unwrap()
}

/// Connects two nodes with a synchronous in-memory channel pair.
fn link(a: &Node, b: &Node) {
    let (ca, cb) = memory_pair();
    a.attach(ca);
    b.attach(cb);
}

/// One tick on every node, in order.
fn tick(nodes: &[&Node]) {
    for node in nodes {
        node.update();
    }
}

/// Collects `(source, payload)` deliveries of a node's user lane.
fn record_messages(node: &Node) -> Arc<Mutex<Vec<(Identifier, Vec<u8>)>>> {
    let log: Arc<Mutex<Vec<(Identifier, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    node.on_message(move |remote_id, payload| {
        sink.lock().push((remote_id, payload));
    });
    log
}

#[test]
fn test_two_node_unicast() {
    let a = unlistening_node();
    let b = unlistening_node();
    let a_log = record_messages(&a);
    let b_log = record_messages(&b);

    link(&a, &b);
    for _ in 0..2 {
        tick(&[&a, &b]);
    }
    assert!(a.is_connected());
    assert!(b.is_connected());

    a.send(b.id().as_bytes(), b"ping").unwrap();
    let delivered = b_log.lock();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, a.id());
    assert_eq!(delivered[0].1, b"ping");
    assert!(a_log.lock().is_empty());
}

#[test]
fn test_three_node_relay() {
    let a = unlistening_node();
    let b = unlistening_node();
    let c = unlistening_node();
    let a_log = record_messages(&a);
    let b_log = record_messages(&b);
    let c_log = record_messages(&c);

    link(&a, &b);
    link(&b, &c);
    for _ in 0..3 {
        tick(&[&a, &b, &c]);
    }

    // A and C are not direct neighbors, yet route through B.
    a.send(c.id().as_bytes(), b"hello").unwrap();
    let delivered = c_log.lock();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, a.id());
    assert_eq!(delivered[0].1, b"hello");
    assert!(a_log.lock().is_empty());
    assert!(b_log.lock().is_empty());
}

#[test]
fn test_broadcast_fanout() {
    let a = unlistening_node();
    let b = unlistening_node();
    let c = unlistening_node();
    let a_log = record_messages(&a);
    let b_log = record_messages(&b);
    let c_log = record_messages(&c);

    link(&a, &b);
    link(&b, &c);
    for _ in 0..3 {
        tick(&[&a, &b, &c]);
    }

    a.broadcast(b"hi").unwrap();
    for log in [&b_log, &c_log] {
        let delivered = log.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, a.id());
        assert_eq!(delivered[0].1, b"hi");
    }
    assert!(a_log.lock().is_empty());
}

#[test]
fn test_stale_frame_reinjection_is_dropped() {
    let a = unlistening_node();
    let b = unlistening_node();
    let c = unlistening_node();
    let c_log = record_messages(&c);

    link(&a, &b);
    let (near, far) = memory_pair();
    let tap = TapChannel::new(far);
    b.attach(near);
    c.attach(tap.clone());
    for _ in 0..3 {
        tick(&[&a, &b, &c]);
    }

    tap.clear();
    a.send(c.id().as_bytes(), b"hello").unwrap();
    assert_eq!(c_log.lock().len(), 1);

    // Re-inject byte-exact copies of everything C received.
    tap.replay_all();
    assert_eq!(c_log.lock().len(), 1);
}

#[test]
fn test_tampered_frame_is_dropped() {
    let a = unlistening_node();
    let b = unlistening_node();
    let c = unlistening_node();
    let c_log = record_messages(&c);

    link(&a, &b);
    let (near, far) = memory_pair();
    let tap = TapChannel::new(far);
    b.attach(near);
    c.attach(tap.clone());
    for _ in 0..3 {
        tick(&[&a, &b, &c]);
    }

    tap.clear();
    a.send(c.id().as_bytes(), b"hello").unwrap();
    assert_eq!(c_log.lock().len(), 1);

    // Flip one ciphertext byte in each captured frame and re-inject.
    tap.replay_all_tampered();
    assert_eq!(c_log.lock().len(), 1);
}

#[test]
fn test_simultaneous_peering_tiebreaker() {
    let net = LoopbackNet::new();
    let c1 = net.connector();
    let c2 = net.connector();
    let config = Configuration { port: None, ..Configuration::default() };
    let n1 = Node::with_connector(config.clone(), c1.clone()).unwrap();
    let n2 = Node::with_connector(config, c2.clone()).unwrap();
    c1.set_local(n1.id());
    c2.set_local(n2.id());

    // Bootstrap over a deferred link so offers can actually collide.
    let (q1, q2) = queue_pair();
    n1.attach(q1.clone());
    n2.attach(q2.clone());
    for _ in 0..4 {
        tick(&[&n1, &n2]);
        q1.flush();
        q2.flush();
    }
    assert!(n1.is_connected());
    assert!(n2.is_connected());

    // Both sides dial at once; the offers cross in flight.
    n1.connect(&n2.id().to_string()).unwrap();
    n2.connect(&n1.id().to_string()).unwrap();
    for _ in 0..4 {
        q1.flush();
        q2.flush();
        tick(&[&n1, &n2]);
    }

    // The larger identifier ignored the colliding offer, so exactly one
    // direct channel opened.
    assert_eq!(net.pairs_opened(), 1);
}

// ---------------------------------------------------------------------------
// Test doubles

/// Channel wrapper recording every frame delivered through it, able to
/// re-inject byte-exact or tampered copies.
struct TapChannel {
    weak: Mutex<Weak<TapChannel>>,
    inner: Arc<dyn Channel>,
    seen: Mutex<Vec<Vec<u8>>>,
    callback: Mutex<Option<FrameCallback>>,
}

impl TapChannel {
    fn new(inner: Arc<dyn Channel>) -> Arc<Self> {
        let tap = Arc::new(Self {
            weak: Mutex::new(Weak::new()),
            inner,
            seen: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
        });
        *tap.weak.lock() = Arc::downgrade(&tap);
        tap
    }

    fn clear(&self) {
        self.seen.lock().clear();
    }

    fn replay_all(&self) {
        let frames = self.seen.lock().clone();
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            for frame in frames {
                callback(&frame);
            }
        }
    }

    fn replay_all_tampered(&self) {
        let frames = self.seen.lock().clone();
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            for mut frame in frames {
                if frame.len() > 80 {
                    // Somewhere in the body, well before the signature.
                    let index = frame.len() - 70;
                    frame[index] ^= 0x01;
                }
                callback(&frame);
            }
        }
    }
}

impl Channel for TapChannel {
    fn id(&self) -> u64 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn send(&self, frame: &[u8]) -> Result<()> {
        self.inner.send(frame)
    }

    fn close(&self) {
        self.inner.close()
    }

    fn on_frame(&self, callback: Option<FrameCallback>) {
        *self.callback.lock() = callback.clone();
        match callback {
            None => self.inner.on_frame(None),
            Some(_) => {
                let weak = self.weak.lock().clone();
                self.inner.on_frame(Some(Arc::new(move |frame: &[u8]| {
                    let Some(tap) = weak.upgrade() else { return };
                    tap.seen.lock().push(frame.to_vec());
                    let callback = tap.callback.lock().clone();
                    if let Some(callback) = callback {
                        callback(frame);
                    }
                })));
            }
        }
    }

    fn on_close(&self, callback: Option<CloseCallback>) {
        self.inner.on_close(callback)
    }
}

/// In-memory channel that queues outbound frames until `flush`, letting
/// tests make messages cross in flight.
struct QueueChannel {
    inner: Arc<dyn Channel>,
    peer_pending: Arc<Mutex<Vec<Vec<u8>>>>,
}

fn queue_pair() -> (Arc<QueueChannel>, Arc<QueueChannel>) {
    let (a, b) = memory_pair();
    let a_to_b = Arc::new(Mutex::new(Vec::new()));
    let b_to_a = Arc::new(Mutex::new(Vec::new()));
    (
        Arc::new(QueueChannel { inner: a, peer_pending: a_to_b.clone() }),
        Arc::new(QueueChannel { inner: b, peer_pending: b_to_a.clone() }),
    )
}

impl QueueChannel {
    /// Delivers every queued outbound frame to the peer.
    fn flush(&self) {
        loop {
            let frame = {
                let mut pending = self.peer_pending.lock();
                if pending.is_empty() {
                    break;
                }
                pending.remove(0)
            };
            let _ = self.inner.send(&frame);
        }
    }
}

impl Channel for QueueChannel {
    fn id(&self) -> u64 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn send(&self, frame: &[u8]) -> Result<()> {
        self.peer_pending.lock().push(frame.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.inner.close()
    }

    fn on_frame(&self, callback: Option<FrameCallback>) {
        self.inner.on_frame(callback)
    }

    fn on_close(&self, callback: Option<CloseCallback>) {
        self.inner.on_close(callback)
    }
}

/// Loopback direct-connection fabric: descriptions are empty blobs and a
/// completed offer/answer exchange opens an in-memory channel pair.
struct LoopbackNet {
    connections: Arc<Mutex<HashMap<(Identifier, Identifier), Arc<LoopbackConnection>>>>,
    pairs: Arc<AtomicUsize>,
}

impl LoopbackNet {
    fn new() -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            pairs: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn connector(&self) -> Arc<LoopbackConnector> {
        Arc::new(LoopbackConnector {
            local: OnceLock::new(),
            connections: self.connections.clone(),
            pairs: self.pairs.clone(),
        })
    }

    fn pairs_opened(&self) -> usize {
        self.pairs.load(Ordering::SeqCst)
    }
}

struct LoopbackConnector {
    local: OnceLock<Identifier>,
    connections: Arc<Mutex<HashMap<(Identifier, Identifier), Arc<LoopbackConnection>>>>,
    pairs: Arc<AtomicUsize>,
}

impl LoopbackConnector {
    fn set_local(&self, id: Identifier) {
        self.local.set(id).unwrap();
    }
}

impl Connector for LoopbackConnector {
    fn open(
        &self,
        remote_id: &Identifier,
        _relays: Vec<String>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Arc<dyn Connection> {
        let local = *self.local.get().expect("local id not set");
        let connection = Arc::new(LoopbackConnection {
            local,
            remote: *remote_id,
            handler,
            state: Mutex::new(SignalingState::Stable),
            connections: self.connections.clone(),
            pairs: self.pairs.clone(),
        });
        self.connections.lock().insert((local, *remote_id), connection.clone());
        connection
    }
}

struct LoopbackConnection {
    local: Identifier,
    remote: Identifier,
    handler: Arc<dyn ConnectionHandler>,
    state: Mutex<SignalingState>,
    connections: Arc<Mutex<HashMap<(Identifier, Identifier), Arc<LoopbackConnection>>>>,
    pairs: Arc<AtomicUsize>,
}

impl Connection for LoopbackConnection {
    fn offer(&self) {
        *self.state.lock() = SignalingState::HaveLocalOffer;
        self.handler.on_local_description(Description {
            kind: DESCRIPTION_OFFER.to_string(),
            content: String::new(),
        });
    }

    fn apply_remote_description(&self, description: Description) -> legio::Result<()> {
        match description.kind.as_str() {
            DESCRIPTION_OFFER => {
                *self.state.lock() = SignalingState::Stable;
                self.handler.on_local_description(Description {
                    kind: DESCRIPTION_ANSWER.to_string(),
                    content: String::new(),
                });
                Ok(())
            }
            DESCRIPTION_ANSWER => {
                *self.state.lock() = SignalingState::Stable;
                let (near, far) = memory_pair();
                self.pairs.fetch_add(1, Ordering::SeqCst);
                self.handler.on_channel(near);
                let peer = self.connections.lock().get(&(self.remote, self.local)).cloned();
                if let Some(peer) = peer {
                    peer.handler.on_channel(far);
                }
                Ok(())
            }
            _ => Err(legio::Error::Malformed("unknown description type")),
        }
    }

    fn signaling_state(&self) -> SignalingState {
        *self.state.lock()
    }

    fn close(&self) {}
}
