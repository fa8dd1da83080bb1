//! Network object resolution.
//!
//! Block validation needs ancestors and referenced transactions that may
//! not be local yet. [`ObjectFetcher`] is the rendezvous between that need
//! and the gossip layer: `ensure` asks every live peer for the object and
//! parks on a per-id slot that the session intake path fires once the
//! object has been validated and stored. Validators depend on the
//! [`ObjectSource`] trait rather than the concrete fetcher, which breaks
//! the cycle between validation and the sessions that invoke it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use marabu_core::error::ProtocolError;
use marabu_core::message::Message;
use marabu_core::types::{Object, ObjectId};

use crate::peers::PeerSet;
use crate::storage::Store;

/// Capability to resolve an object id to a validated object, fetching from
/// the network when necessary.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Return the object, waiting for a peer to deliver it if needed.
    /// Fails with `UNFINDABLE_OBJECT` when no peer delivers in time.
    async fn ensure(&self, id: &ObjectId) -> Result<Object, ProtocolError>;
}

/// Fetches missing objects from peers with a bounded wait.
pub struct ObjectFetcher {
    store: Arc<Store>,
    peers: Arc<PeerSet>,
    waiters: Mutex<HashMap<ObjectId, broadcast::Sender<Object>>>,
    timeout: Duration,
}

impl ObjectFetcher {
    pub fn new(store: Arc<Store>, peers: Arc<PeerSet>, timeout: Duration) -> Self {
        Self {
            store,
            peers,
            waiters: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Resolve the slot for `id`, waking every waiter. Called by the
    /// session intake path after an object is validated and stored, and
    /// tolerant of duplicate resolutions: the first one wins, later calls
    /// find no slot.
    pub fn deliver(&self, id: &ObjectId, object: &Object) {
        if let Some(slot) = self.waiters.lock().remove(id) {
            // Waiters may have timed out and dropped their receivers; a
            // failed send is fine.
            let _ = slot.send(object.clone());
        }
    }

    /// Subscribe to the slot for `id`, creating it if absent.
    fn subscribe(&self, id: &ObjectId) -> broadcast::Receiver<Object> {
        match self.waiters.lock().entry(*id) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(entry) => {
                let (slot, receiver) = broadcast::channel(1);
                entry.insert(slot);
                receiver
            }
        }
    }

    /// Remove the slot for `id` if no other waiter is parked on it.
    fn reap(&self, id: &ObjectId) {
        let mut waiters = self.waiters.lock();
        if let Some(slot) = waiters.get(id) {
            if slot.receiver_count() == 0 {
                waiters.remove(id);
            }
        }
    }

    /// Number of ids with outstanding waiters.
    pub fn pending(&self) -> usize {
        self.waiters.lock().len()
    }
}

#[async_trait]
impl ObjectSource for ObjectFetcher {
    async fn ensure(&self, id: &ObjectId) -> Result<Object, ProtocolError> {
        if let Some(object) = self.store.get_object(id).map_err(ProtocolError::from)? {
            return Ok(object);
        }

        let mut receiver = self.subscribe(id);

        // Re-check after subscribing: a delivery between the first store
        // probe and the subscription would otherwise be missed.
        if let Some(object) = self.store.get_object(id).map_err(ProtocolError::from)? {
            drop(receiver);
            self.reap(id);
            return Ok(object);
        }

        debug!(object = %id, "requesting object from peers");
        self.peers.broadcast(&Message::GetObject { objectid: *id });

        let outcome = tokio::time::timeout(self.timeout, receiver.recv()).await;
        drop(receiver);
        match outcome {
            Ok(Ok(object)) => Ok(object),
            Ok(Err(_)) | Err(_) => {
                self.reap(id);
                Err(ProtocolError::UnfindableObject(id.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marabu_core::types::{PubKey, Transaction, TxOutput};

    fn sample_object(height: u64) -> Object {
        Object::Transaction(Transaction {
            inputs: None,
            height: Some(height),
            outputs: vec![TxOutput {
                pubkey: PubKey([0xaa; 32]),
                value: 50,
            }],
        })
    }

    fn fetcher(timeout: Duration) -> (tempfile::TempDir, Arc<ObjectFetcher>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("db")).unwrap());
        let peers = Arc::new(PeerSet::new());
        (dir, Arc::new(ObjectFetcher::new(store, peers, timeout)))
    }

    #[tokio::test]
    async fn stored_object_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("db")).unwrap());
        let object = sample_object(0);
        let id = object.id().unwrap();
        store.put_object(&id, &object).unwrap();

        let fetcher = ObjectFetcher::new(store, Arc::new(PeerSet::new()), Duration::from_secs(1));
        assert_eq!(fetcher.ensure(&id).await.unwrap(), object);
        assert_eq!(fetcher.pending(), 0);
    }

    #[tokio::test]
    async fn delivery_wakes_the_waiter() {
        let (_dir, fetcher) = fetcher(Duration::from_secs(5));
        let object = sample_object(1);
        let id = object.id().unwrap();

        let waiter = {
            let fetcher = fetcher.clone();
            tokio::spawn(async move { fetcher.ensure(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        fetcher.deliver(&id, &object);

        assert_eq!(waiter.await.unwrap().unwrap(), object);
    }

    #[tokio::test]
    async fn concurrent_waiters_share_one_slot() {
        let (_dir, fetcher) = fetcher(Duration::from_secs(5));
        let object = sample_object(2);
        let id = object.id().unwrap();

        let spawn_waiter = |f: Arc<ObjectFetcher>| tokio::spawn(async move { f.ensure(&id).await });
        let a = spawn_waiter(fetcher.clone());
        let b = spawn_waiter(fetcher.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fetcher.pending(), 1);

        fetcher.deliver(&id, &object);
        assert_eq!(a.await.unwrap().unwrap(), object);
        assert_eq!(b.await.unwrap().unwrap(), object);
        assert_eq!(fetcher.pending(), 0);
    }

    #[tokio::test]
    async fn timeout_yields_unfindable_and_reaps_slot() {
        let (_dir, fetcher) = fetcher(Duration::from_millis(30));
        let object = sample_object(3);
        let id = object.id().unwrap();

        let err = fetcher.ensure(&id).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnfindableObject(_)));
        assert_eq!(fetcher.pending(), 0);
    }

    #[tokio::test]
    async fn late_delivery_after_timeout_is_harmless() {
        let (_dir, fetcher) = fetcher(Duration::from_millis(30));
        let object = sample_object(4);
        let id = object.id().unwrap();

        assert!(fetcher.ensure(&id).await.is_err());
        fetcher.deliver(&id, &object);
        assert_eq!(fetcher.pending(), 0);
    }
}
