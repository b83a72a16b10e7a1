//! Relay credential provisioning
//!
//! Nodes behind NATs need relay servers to peer. Peers operating a relay
//! advertise the capability in their State; everyone else periodically
//! solicits short-lived credentials from a random advertiser and caches
//! them. A node configured with an external relay host answers
//! solicitations with generated credentials.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use tracing::{debug, info};

use crate::binary::{pack_strings, unpack_strings};
use crate::crypto::{Identifier, SigningPair};
use crate::graph::{Graph, PROVISION_HAS_TURN};
use crate::message::MessageType;
use crate::routing::Routing;
use crate::transport::Transport;

/// Cached entries are evicted at this age.
const ENTRY_LIFETIME: Duration = Duration::from_secs(30 * 60);
/// Entries younger than this count towards the solicitation target.
const FRESH_WINDOW: Duration = Duration::from_secs(10 * 60);
/// Solicit until this many fresh entries are cached.
const TARGET_FRESH: usize = 4;
/// Issued credentials are rotated halfway through the entry lifetime.
const CREDENTIAL_ROTATION: Duration = Duration::from_secs(15 * 60);

const REQUEST_TYPE: &str = "turn";

/// A cached relay credential handed out by a peer.
#[derive(Debug, Clone)]
pub struct Entry {
    pub source: Identifier,
    pub host: String,
    pub username: String,
    pub password: String,
    pub time: Instant,
}

impl Entry {
    pub fn url(&self) -> String {
        format!("turn:{}:{}@{}", self.username, self.password, self.host)
    }

    pub fn age(&self) -> Duration {
        self.time.elapsed()
    }
}

struct IssuedCredentials {
    username: String,
    password: String,
    created: Instant,
}

fn random_token(len: usize) -> String {
    thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

pub struct Provisioning {
    transport: Arc<Transport>,
    graph: Arc<Graph>,
    relay_host: Option<String>,
    entries: Mutex<HashMap<Identifier, Entry>>,
    issued: Mutex<Option<IssuedCredentials>>,
}

impl Provisioning {
    /// `relay_host`, when set, makes this node answer solicitations with
    /// credentials for that relay.
    pub fn new(
        graph: Arc<Graph>,
        routing: Arc<Routing>,
        signing: Arc<SigningPair>,
        relay_host: Option<String>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Provisioning>| {
            let callback = {
                let weak = weak.clone();
                Box::new(move |remote_id: Identifier, payload: Vec<u8>| {
                    if let Some(provisioning) = weak.upgrade() {
                        provisioning.receive(remote_id, &payload);
                    }
                })
            };
            let transport = Transport::new(
                MessageType::Provisioning,
                graph.clone(),
                routing,
                signing,
                callback,
            );
            Self {
                transport,
                graph,
                relay_host,
                entries: Mutex::new(HashMap::new()),
                issued: Mutex::new(None),
            }
        })
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// One node tick: evict expired entries and, when fewer than the
    /// target number are fresh, solicit a random relay-capable peer that
    /// is not yet cached.
    pub fn update(&self) {
        let (fresh, cached): (usize, Vec<Identifier>) = {
            let mut entries = self.entries.lock();
            entries.retain(|_, entry| entry.age() < ENTRY_LIFETIME);
            let fresh = entries.values().filter(|entry| entry.age() < FRESH_WINDOW).count();
            (fresh, entries.keys().copied().collect())
        };

        if fresh >= TARGET_FRESH {
            return;
        }

        let local_id = self.graph.local_id();
        let mut candidates = self.graph.nodes(PROVISION_HAS_TURN);
        candidates.shuffle(&mut thread_rng());
        for id in candidates {
            if id == local_id || cached.contains(&id) {
                continue;
            }
            debug!("Soliciting relay credentials from {}", id);
            if let Err(e) = self.transport.send(id, &pack_strings(&[REQUEST_TYPE])) {
                debug!("Solicitation to {} failed: {}", id, e);
            }
            break;
        }
    }

    pub fn insert(&self, entry: Entry) {
        self.entries.lock().insert(entry.source, entry);
    }

    /// Up to `count` random entries without replacement.
    pub fn pick(&self, count: usize) -> Vec<Entry> {
        let entries = self.entries.lock();
        let mut all: Vec<&Entry> = entries.values().collect();
        all.shuffle(&mut thread_rng());
        all.into_iter().take(count).cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    fn receive(&self, remote_id: Identifier, payload: &[u8]) {
        // One string is a solicitation, four are a credential response.
        if let Ok(strings) = unpack_strings(payload, 1) {
            if strings[0] == REQUEST_TYPE {
                self.answer(remote_id);
            }
            return;
        }

        let Ok(strings) = unpack_strings(payload, 4) else {
            debug!("Dropping malformed provisioning payload from {}", remote_id);
            return;
        };
        let [kind, host, username, password] = match <[String; 4]>::try_from(strings) {
            Ok(parts) => parts,
            Err(_) => return,
        };
        if kind != REQUEST_TYPE {
            return;
        }

        info!("Relay credentials from {} for {}", remote_id, host);
        self.insert(Entry {
            source: remote_id,
            host,
            username,
            password,
            time: Instant::now(),
        });
    }

    fn answer(&self, remote_id: Identifier) {
        let Some(host) = &self.relay_host else {
            return; // not operating a relay
        };

        let (username, password) = {
            let mut issued = self.issued.lock();
            let rotate = issued
                .as_ref()
                .map_or(true, |credentials| credentials.created.elapsed() >= CREDENTIAL_ROTATION);
            if rotate {
                *issued = Some(IssuedCredentials {
                    username: random_token(12),
                    password: random_token(24),
                    created: Instant::now(),
                });
            }
            let Some(credentials) = issued.as_ref() else { return };
            (credentials.username.clone(), credentials.password.clone())
        };

        debug!("Issuing relay credentials to {}", remote_id);
        let payload = pack_strings(&[REQUEST_TYPE, host.as_str(), username.as_str(), password.as_str()]);
        if let Err(e) = self.transport.send(remote_id, &payload) {
            debug!("Credential response to {} failed: {}", remote_id, e);
        }
    }
}
