//! RocksDB-backed persistent state.
//!
//! Three protocol keyspaces as column families — `objects` (validated
//! objects by id), `utxos` (post-state UTXO set by block id), `chaintip`
//! (a single well-known key) — plus a `peers` family remembering learned
//! addresses across restarts. Keys are hex strings (or raw addresses for
//! peers); values are JSON.
//!
//! `put_object` is write-once: an id maps to at most one value and re-puts
//! are idempotent no-ops.

use std::path::Path;

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};

use marabu_core::types::{Block, Object, ObjectId, Transaction};
use marabu_core::utxo::Utxo;

use crate::error::NodeError;

// --- Column family names ---

const CF_OBJECTS: &str = "objects";
const CF_UTXOS: &str = "utxos";
const CF_CHAINTIP: &str = "chaintip";
const CF_PEERS: &str = "peers";

const ALL_CFS: &[&str] = &[CF_OBJECTS, CF_UTXOS, CF_CHAINTIP, CF_PEERS];

/// The single key of the `chaintip` family.
const CHAINTIP_KEY: &[u8] = b"tip";

/// The highest valid block seen, with its full contents and height.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: ObjectId,
    pub block: Block,
    pub height: u64,
}

/// RocksDB-backed store for objects, UTXO sets, the chaintip, and peers.
pub struct Store {
    db: DB,
}

impl Store {
    /// Open or create a database at the given path, creating all column
    /// families as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), descriptors)
            .map_err(|e| NodeError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, NodeError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| NodeError::Storage(format!("missing column family {name}")))
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        cf: &str,
        key: &[u8],
    ) -> Result<Option<T>, NodeError> {
        let handle = self.cf(cf)?;
        match self
            .db
            .get_cf(handle, key)
            .map_err(|e| NodeError::Storage(e.to_string()))?
        {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| NodeError::Storage(format!("corrupt {cf} value: {e}"))),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<(), NodeError> {
        let handle = self.cf(cf)?;
        let bytes = serde_json::to_vec(value).map_err(|e| NodeError::Storage(e.to_string()))?;
        self.db
            .put_cf(handle, key, bytes)
            .map_err(|e| NodeError::Storage(e.to_string()))
    }

    // --- Objects ---

    pub fn object_exists(&self, id: &ObjectId) -> Result<bool, NodeError> {
        let handle = self.cf(CF_OBJECTS)?;
        Ok(self
            .db
            .get_cf(handle, id.to_string().as_bytes())
            .map_err(|e| NodeError::Storage(e.to_string()))?
            .is_some())
    }

    pub fn get_object(&self, id: &ObjectId) -> Result<Option<Object>, NodeError> {
        self.get_json(CF_OBJECTS, id.to_string().as_bytes())
    }

    /// Store a validated object. Re-puts of an existing id are no-ops.
    pub fn put_object(&self, id: &ObjectId, object: &Object) -> Result<(), NodeError> {
        if self.object_exists(id)? {
            return Ok(());
        }
        self.put_json(CF_OBJECTS, id.to_string().as_bytes(), object)
    }

    /// Fetch a stored object expected to be a transaction.
    pub fn get_transaction(&self, id: &ObjectId) -> Result<Option<Transaction>, NodeError> {
        Ok(self
            .get_object(id)?
            .and_then(|obj| obj.as_transaction().cloned()))
    }

    /// Fetch a stored object expected to be a block.
    pub fn get_block(&self, id: &ObjectId) -> Result<Option<Block>, NodeError> {
        Ok(self.get_object(id)?.and_then(|obj| obj.as_block().cloned()))
    }

    // --- UTXO index ---

    pub fn utxo_after(&self, block_id: &ObjectId) -> Result<Option<Vec<Utxo>>, NodeError> {
        self.get_json(CF_UTXOS, block_id.to_string().as_bytes())
    }

    pub fn put_utxo_after(&self, block_id: &ObjectId, set: &[Utxo]) -> Result<(), NodeError> {
        self.put_json(CF_UTXOS, block_id.to_string().as_bytes(), &set)
    }

    // --- Chaintip ---

    pub fn chaintip(&self) -> Result<Option<ChainTip>, NodeError> {
        self.get_json(CF_CHAINTIP, CHAINTIP_KEY)
    }

    pub fn set_chaintip(&self, tip: &ChainTip) -> Result<(), NodeError> {
        self.put_json(CF_CHAINTIP, CHAINTIP_KEY, tip)
    }

    // --- Peers ---

    pub fn add_known_peer(&self, addr: &str) -> Result<(), NodeError> {
        let handle = self.cf(CF_PEERS)?;
        self.db
            .put_cf(handle, addr.as_bytes(), [])
            .map_err(|e| NodeError::Storage(e.to_string()))
    }

    pub fn known_peers(&self) -> Result<Vec<String>, NodeError> {
        let handle = self.cf(CF_PEERS)?;
        let mut peers = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| NodeError::Storage(e.to_string()))?;
            match std::str::from_utf8(&key) {
                Ok(addr) => peers.push(addr.to_string()),
                Err(_) => return Err(NodeError::Storage("corrupt peer address".into())),
            }
        }
        Ok(peers)
    }
}
