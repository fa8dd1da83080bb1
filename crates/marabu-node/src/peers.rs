//! Live peer sessions and the known-address book.
//!
//! [`PeerSet`] tracks connected sessions and routes outbound messages to
//! their writer tasks. [`PeerBook`] holds every syntactically valid
//! `host:port` string the node has learned, persisting additions so a
//! restarted node can redial.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use marabu_core::message::Message;
use marabu_core::params::DEFAULT_PORT;

use crate::storage::Store;

/// Whether a session was dialed by us or accepted from the listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

struct PeerHandle {
    addr: String,
    direction: Direction,
    sender: mpsc::UnboundedSender<Message>,
    close: Arc<Notify>,
}

/// The set of live peer sessions.
pub struct PeerSet {
    sessions: Mutex<HashMap<u64, PeerHandle>>,
    next_id: AtomicU64,
}

impl PeerSet {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new session, returning its id, the receiver its writer
    /// task drains, and the close signal its read loop watches.
    pub fn register(
        &self,
        addr: String,
        direction: Direction,
    ) -> (u64, mpsc::UnboundedReceiver<Message>, Arc<Notify>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let close = Arc::new(Notify::new());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().insert(
            id,
            PeerHandle {
                addr,
                direction,
                sender,
                close: close.clone(),
            },
        );
        (id, receiver, close)
    }

    /// Drop a session. Its queued outbound messages still flush before the
    /// writer task observes the closed channel.
    pub fn unregister(&self, id: u64) {
        self.sessions.lock().remove(&id);
    }

    /// Queue a message to one session. Silently ignored if it is gone.
    pub fn send_to(&self, id: u64, message: Message) {
        if let Some(handle) = self.sessions.lock().get(&id) {
            if handle.sender.send(message).is_err() {
                debug!(peer = id, "send to departed session dropped");
            }
        }
    }

    /// Queue a message to every live session.
    pub fn broadcast(&self, message: &Message) {
        for handle in self.sessions.lock().values() {
            let _ = handle.sender.send(message.clone());
        }
    }

    /// Ask a session's read loop to shut down.
    pub fn request_close(&self, id: u64) {
        if let Some(handle) = self.sessions.lock().get(&id) {
            handle.close.notify_one();
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn outbound_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|h| h.direction == Direction::Outbound)
            .count()
    }

    /// Addresses of currently connected sessions.
    pub fn connected_addrs(&self) -> Vec<String> {
        self.sessions
            .lock()
            .values()
            .map(|h| h.addr.clone())
            .collect()
    }
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Known peer addresses, persisted through the store's `peers` keyspace.
pub struct PeerBook {
    store: Arc<Store>,
    known: Mutex<Vec<String>>,
}

impl PeerBook {
    /// Load the book from the store, seeding it with bootstrap addresses.
    pub fn load(store: Arc<Store>, bootstrap: &[String]) -> Self {
        let mut known = match store.known_peers() {
            Ok(peers) => peers,
            Err(e) => {
                warn!("could not load persisted peers: {e}");
                Vec::new()
            }
        };
        for raw in bootstrap {
            match normalize_peer(raw) {
                Some(addr) if !known.contains(&addr) => known.push(addr),
                Some(_) => {}
                None => warn!(peer = raw.as_str(), "ignoring malformed bootstrap peer"),
            }
        }
        Self {
            store,
            known: Mutex::new(known),
        }
    }

    /// Add a validated address. Returns true when it was new.
    pub fn add(&self, addr: &str) -> bool {
        let mut known = self.known.lock();
        if known.iter().any(|a| a == addr) {
            return false;
        }
        known.push(addr.to_string());
        drop(known);
        if let Err(e) = self.store.add_known_peer(addr) {
            warn!(peer = addr, "could not persist peer: {e}");
        }
        true
    }

    pub fn all(&self) -> Vec<String> {
        self.known.lock().clone()
    }
}

/// Validate and normalize a `host:port` peer string.
///
/// IPv6 addresses are recognized by a `]` before the last `:` and must be
/// bracketed. A missing port defaults to 18018; port 0 is rejected.
pub fn normalize_peer(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.len() > 256 {
        return None;
    }

    if let Some(rest) = raw.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        host.parse::<Ipv6Addr>().ok()?;
        let port = match after {
            "" => DEFAULT_PORT,
            rest => parse_port(rest.strip_prefix(':')?)?,
        };
        return Some(format!("[{host}]:{port}"));
    }

    // A bare host with more than one colon would be an unbracketed IPv6
    // address; those are rejected.
    let (host, port) = match raw.rsplit_once(':') {
        Some((host, port_str)) if !host.contains(':') => (host, parse_port(port_str)?),
        Some(_) => return None,
        None => (raw, DEFAULT_PORT),
    };

    if host.parse::<Ipv4Addr>().is_ok() || is_valid_hostname(host) {
        Some(format!("{host}:{port}"))
    } else {
        None
    }
}

fn parse_port(s: &str) -> Option<u16> {
    let port: u16 = s.parse().ok()?;
    (port != 0).then_some(port)
}

fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}
