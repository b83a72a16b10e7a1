//! Core event fan-out
//!
//! Routing publishes events; interested components subscribe a handler at
//! wiring time and pattern-match on the variant. Handlers run synchronously
//! on the publishing thread, so they must stay short or defer through the
//! scheduler.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::channel::Channel;
use crate::crypto::Identifier;
use crate::message::Message;

#[derive(Clone)]
pub enum Event {
    /// A message addressed to this node (or a broadcast) was delivered by
    /// the routing fabric. `channel` is the arrival channel, `None` for
    /// locally originated messages.
    Message {
        message: Arc<Message>,
        channel: Option<Arc<dyn Channel>>,
    },

    /// A neighbor binding appeared (`channel` set) or went away
    /// (`channel` is `None`).
    Neighbor {
        id: Identifier,
        channel: Option<Arc<dyn Channel>>,
    },
}

pub type EventHandler = Box<dyn Fn(&Event) + Send + Sync>;

/// Fans events out to all subscribed handlers in subscription order.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<Vec<EventHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: EventHandler) {
        self.handlers.write().push(handler);
    }

    pub fn dispatch(&self, event: &Event) {
        // Handlers may publish further events from within a dispatch.
        let handlers = self.handlers.read_recursive();
        for handler in handlers.iter() {
            handler(event);
        }
    }
}
