//! Channel contract consumed by the routing fabric
//!
//! A channel is a bidirectional frame pipe with open/close/send/receive
//! semantics; framing is the channel implementation's job. Inbound frames
//! may be delivered from any thread. The in-memory pair here delivers
//! synchronously and is used by tests and in-process embedders; the TCP
//! implementation lives in `server`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::{Error, Result};

pub type FrameCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique channel id. Implementations of [`Channel`]
/// obtain their id here so channels can be tracked in maps and compared.
pub fn next_channel_id() -> u64 {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

pub trait Channel: Send + Sync {
    /// Process-unique id, stable for the channel's lifetime.
    fn id(&self) -> u64;

    fn is_open(&self) -> bool;

    /// Queues one frame for delivery to the remote end.
    fn send(&self, frame: &[u8]) -> Result<()>;

    fn close(&self);

    /// Installs the inbound frame callback; `None` clears it. The callback
    /// may be invoked from any thread and must not assume a particular one.
    fn on_frame(&self, callback: Option<FrameCallback>);

    /// Installs the close callback; fired once when the channel goes down.
    fn on_close(&self, callback: Option<CloseCallback>);
}

/// Synchronous in-process channel; frames sent on one end are delivered
/// directly to the other end's frame callback on the calling thread.
pub struct MemoryChannel {
    id: u64,
    open: AtomicBool,
    peer: RwLock<Weak<MemoryChannel>>,
    frame_callback: RwLock<Option<FrameCallback>>,
    close_callback: RwLock<Option<CloseCallback>>,
}

impl MemoryChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: next_channel_id(),
            open: AtomicBool::new(true),
            peer: RwLock::new(Weak::new()),
            frame_callback: RwLock::new(None),
            close_callback: RwLock::new(None),
        })
    }

    fn deliver(&self, frame: &[u8]) {
        let callback = self.frame_callback.read().clone();
        if let Some(callback) = callback {
            callback(frame);
        }
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let callback = self.close_callback.read().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

impl Channel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }
        let peer = self.peer.read().upgrade().ok_or(Error::ChannelClosed)?;
        peer.deliver(frame);
        Ok(())
    }

    fn close(&self) {
        let peer = self.peer.read().upgrade();
        self.shutdown();
        if let Some(peer) = peer {
            peer.shutdown();
        }
    }

    fn on_frame(&self, callback: Option<FrameCallback>) {
        *self.frame_callback.write() = callback;
    }

    fn on_close(&self, callback: Option<CloseCallback>) {
        *self.close_callback.write() = callback;
    }
}

/// Creates a connected pair of in-memory channels.
pub fn memory_pair() -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
    let a = MemoryChannel::new();
    let b = MemoryChannel::new();
    *a.peer.write() = Arc::downgrade(&b);
    *b.peer.write() = Arc::downgrade(&a);
    (a, b)
}
