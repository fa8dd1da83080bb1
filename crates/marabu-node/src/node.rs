//! Node composition and the object intake path.
//!
//! [`Node`] wires the store, fetcher, mempool, and peer services together.
//! Every object — gossiped by a peer or produced locally — enters through
//! [`Node::receive_object`], which validates, persists, resolves fetcher
//! waiters, and keeps the chaintip and mempool consistent.
//!
//! Chain mutations are serialized by a commit lock; validation itself runs
//! concurrently, and the store's idempotent puts make duplicate deliveries
//! harmless.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use marabu_core::error::ProtocolError;
use marabu_core::params::ChainParams;
use marabu_core::types::{Object, ObjectId, Transaction};
use marabu_core::utxo::{self, UtxoSet};
use marabu_core::validation;

use crate::chain;
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::fetcher::{ObjectFetcher, ObjectSource};
use crate::mempool::Mempool;
use crate::peers::{Direction, PeerBook, PeerSet};
use crate::session;
use crate::storage::{ChainTip, Store};
use crate::validator::{self, BlockAcceptance};

/// What happened to an object handed to [`Node::receive_object`].
#[derive(Debug)]
pub struct Intake {
    /// The object's id.
    pub id: ObjectId,
    /// Whether this call stored the object (false: it was already known).
    pub newly_stored: bool,
    /// A valid transaction that could not be applied to the mempool; the
    /// delivering session reports this error without closing.
    pub mempool_rejection: Option<ProtocolError>,
}

/// A running Marabu node.
pub struct Node {
    pub config: NodeConfig,
    pub params: ChainParams,
    pub store: Arc<Store>,
    pub peers: Arc<PeerSet>,
    pub book: PeerBook,
    pub fetcher: Arc<ObjectFetcher>,
    mempool: Mutex<Mempool>,
    /// Serializes UTXO/object/chaintip writes and mempool swaps.
    chain_lock: Mutex<()>,
    /// Addresses this process has already tried; failed dials are not
    /// retried eagerly.
    dialed: Mutex<HashSet<String>>,
}

impl Node {
    /// Open the store and assemble a node. The mempool starts empty,
    /// rooted at the persisted chaintip's UTXO set.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        let store = Arc::new(Store::open(config.db_path())?);
        let peers = Arc::new(PeerSet::new());
        let fetcher = Arc::new(ObjectFetcher::new(
            store.clone(),
            peers.clone(),
            config.fetch_timeout,
        ));
        let book = PeerBook::load(store.clone(), &config.bootstrap_peers);

        let base = match store.chaintip()? {
            Some(tip) => {
                info!(height = tip.height, block = %tip.hash, "resuming at chaintip");
                let entries = store.utxo_after(&tip.hash)?.ok_or_else(|| {
                    NodeError::Storage(format!("no UTXO set stored for chaintip {}", tip.hash))
                })?;
                utxo::from_entries(&entries)
            }
            None => UtxoSet::new(),
        };

        Ok(Arc::new(Self {
            params: config.params.clone(),
            store,
            peers,
            book,
            fetcher,
            mempool: Mutex::new(Mempool::new(base)),
            chain_lock: Mutex::new(()),
            dialed: Mutex::new(HashSet::new()),
            config,
        }))
    }

    /// Current chaintip, if any block has been accepted.
    pub fn chaintip(&self) -> Result<Option<ChainTip>, NodeError> {
        self.store.chaintip()
    }

    /// Ordered txids of the current mempool.
    pub fn mempool_txids(&self) -> Vec<ObjectId> {
        self.mempool.lock().txids()
    }

    /// Validate and take in one object.
    ///
    /// On success the object is stored, fetcher waiters for its id are
    /// resolved, and — for blocks — the chaintip and mempool are brought up
    /// to date. Validation failures are returned for the session to report.
    pub async fn receive_object(self: &Arc<Self>, object: Object) -> Result<Intake, ProtocolError> {
        let id = object.id()?;

        if self.store.object_exists(&id).map_err(ProtocolError::from)? {
            // A waiter may still be parked on this id if two peers raced.
            self.fetcher.deliver(&id, &object);
            return Ok(Intake {
                id,
                newly_stored: false,
                mempool_rejection: None,
            });
        }

        match &object {
            Object::Transaction(tx) => {
                validation::validate_transaction(tx, |txid| {
                    self.store.get_object(txid).map_err(ProtocolError::from)
                })?;
                self.store.put_object(&id, &object).map_err(ProtocolError::from)?;
                self.fetcher.deliver(&id, &object);

                let mempool_rejection = if tx.is_coinbase() {
                    None
                } else {
                    self.apply_to_mempool(&id, tx).err()
                };
                Ok(Intake {
                    id,
                    newly_stored: true,
                    mempool_rejection,
                })
            }
            Object::Block(block) => {
                let source: Arc<dyn ObjectSource> = self.fetcher.clone();
                let acceptance =
                    validator::validate_block(&self.store, &self.params, source, &id, block)
                        .await?;
                self.commit_block(&id, &object, acceptance)?;
                self.fetcher.deliver(&id, &object);
                Ok(Intake {
                    id,
                    newly_stored: true,
                    mempool_rejection: None,
                })
            }
        }
    }

    fn apply_to_mempool(&self, id: &ObjectId, tx: &Transaction) -> Result<(), ProtocolError> {
        self.mempool.lock().try_apply(id, tx)
    }

    /// Persist an accepted block and, if it is the new highest block,
    /// advance the chaintip and rebuild the mempool on top of it.
    ///
    /// Write order matters: the block's UTXO set, then the object, then the
    /// chaintip, then the in-memory mempool swap. A mempool rebuild failure
    /// keeps the previous mempool and is logged, not propagated.
    fn commit_block(
        self: &Arc<Self>,
        id: &ObjectId,
        object: &Object,
        acceptance: BlockAcceptance,
    ) -> Result<(), ProtocolError> {
        let block = match object.as_block() {
            Some(block) => block,
            None => return Err(ProtocolError::internal("commit_block called with a transaction")),
        };
        let _guard = self.chain_lock.lock();

        self.store
            .put_utxo_after(id, &utxo::to_entries(&acceptance.utxo_after))
            .map_err(ProtocolError::from)?;
        self.store.put_object(id, object).map_err(ProtocolError::from)?;

        let current = self.store.chaintip().map_err(ProtocolError::from)?;
        let advances = current
            .as_ref()
            .map_or(true, |tip| acceptance.height > tip.height);
        if !advances {
            return Ok(());
        }

        let new_tip = ChainTip {
            hash: *id,
            block: block.clone(),
            height: acceptance.height,
        };
        self.store.set_chaintip(&new_tip).map_err(ProtocolError::from)?;
        info!(height = new_tip.height, block = %id, "chaintip advanced");

        let old_txids = self.mempool.lock().txids();
        let rebuilt = (|| {
            let mut candidates = match &current {
                Some(old) => chain::forgotten_txids(&self.store, old, &new_tip)?,
                None => Vec::new(),
            };
            candidates.extend(old_txids);
            Mempool::rebuild(&self.store, &new_tip, &candidates)
        })();
        match rebuilt {
            Ok(pool) => *self.mempool.lock() = pool,
            Err(e) => error!("mempool reorganization failed, keeping previous mempool: {e}"),
        }
        Ok(())
    }

    /// Open outgoing connections until the configured target is reached.
    /// Addresses are tried at most once per process.
    pub fn dial_to_target(self: &Arc<Self>) {
        let connected: HashSet<String> = self.peers.connected_addrs().into_iter().collect();
        let mut remaining = self
            .config
            .target_outbound
            .saturating_sub(self.peers.outbound_count());
        let mut dialed = self.dialed.lock();

        for addr in self.book.all() {
            if remaining == 0 {
                break;
            }
            if connected.contains(&addr) || dialed.contains(&addr) {
                continue;
            }
            dialed.insert(addr.clone());
            remaining -= 1;

            let node = self.clone();
            tokio::spawn(async move {
                match TcpStream::connect(&addr).await {
                    Ok(stream) => {
                        info!(peer = %addr, "outbound connection established");
                        session::run(node, stream, addr, Direction::Outbound).await;
                    }
                    Err(e) => warn!(peer = %addr, "dial failed: {e}"),
                }
            });
        }
    }

    /// Bind the listener, dial bootstrap peers, and serve inbound sessions.
    pub async fn run(self: Arc<Self>) -> Result<(), NodeError> {
        let listener = TcpListener::bind(self.config.listen_socket()).await?;
        info!("listening on {}", self.config.listen_socket());
        self.dial_to_target();

        loop {
            let (stream, remote) = listener.accept().await?;
            info!(peer = %remote, "inbound connection");
            let node = self.clone();
            tokio::spawn(async move {
                session::run(node, stream, remote.to_string(), Direction::Inbound).await;
            });
        }
    }
}
