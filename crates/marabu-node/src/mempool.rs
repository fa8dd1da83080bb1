//! The mempool: non-coinbase transactions applicable atop the chaintip.
//!
//! State is an ordered txid list plus the UTXO view obtained by applying
//! those transactions, in order, to the tip's stored UTXO set. The list is
//! rebuilt on every chaintip change and is not persisted: a restarted node
//! starts from the tip's UTXO set with an empty list.

use tracing::debug;

use marabu_core::error::ProtocolError;
use marabu_core::types::{ObjectId, Transaction};
use marabu_core::utxo::{self, UtxoSet};

use crate::storage::{ChainTip, Store};

/// Ordered pending transactions and their UTXO view.
pub struct Mempool {
    txids: Vec<ObjectId>,
    utxos: UtxoSet,
}

impl Mempool {
    /// An empty mempool rooted at the given UTXO set.
    pub fn new(base: UtxoSet) -> Self {
        Self {
            txids: Vec::new(),
            utxos: base,
        }
    }

    pub fn txids(&self) -> Vec<ObjectId> {
        self.txids.clone()
    }

    pub fn contains(&self, txid: &ObjectId) -> bool {
        self.txids.contains(txid)
    }

    pub fn len(&self) -> usize {
        self.txids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txids.is_empty()
    }

    /// The UTXO view with every pending transaction applied.
    pub fn utxo_view(&self) -> &UtxoSet {
        &self.utxos
    }

    /// Append a validated non-coinbase transaction.
    ///
    /// Fails with `INVALID_TX_OUTPOINT` when an input is not available in
    /// the view (spent by the chain or by an earlier pending transaction);
    /// the view is unchanged in that case. Re-adding a pending transaction
    /// is a no-op.
    pub fn try_apply(&mut self, txid: &ObjectId, tx: &Transaction) -> Result<(), ProtocolError> {
        if tx.is_coinbase() {
            return Err(ProtocolError::internal(
                "coinbase transactions are not eligible for the mempool",
            ));
        }
        if self.contains(txid) {
            return Ok(());
        }
        utxo::apply_transaction(&mut self.utxos, txid, tx)?;
        self.txids.push(*txid);
        Ok(())
    }

    /// Rebuild a mempool atop a new chaintip from an ordered candidate
    /// list (transactions forgotten by the reorganization, then the old
    /// mempool's transactions).
    ///
    /// Candidates that no longer apply are dropped silently; any other
    /// failure aborts the rebuild so the caller can keep the previous
    /// mempool.
    pub fn rebuild(
        store: &Store,
        tip: &ChainTip,
        candidates: &[ObjectId],
    ) -> Result<Self, ProtocolError> {
        let entries = store.utxo_after(&tip.hash).map_err(ProtocolError::from)?.ok_or_else(|| {
            ProtocolError::internal(format!("no UTXO set stored for chaintip {}", tip.hash))
        })?;
        let mut pool = Mempool::new(utxo::from_entries(&entries));

        for txid in candidates {
            let tx = store.get_transaction(txid).map_err(ProtocolError::from)?.ok_or_else(|| {
                ProtocolError::internal(format!("mempool candidate {txid} missing from store"))
            })?;
            if tx.is_coinbase() {
                continue;
            }
            match pool.try_apply(txid, &tx) {
                Ok(()) => {}
                Err(ProtocolError::InvalidTxOutpoint(reason)) => {
                    debug!(tx = %txid, %reason, "dropping transaction during reorganization");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marabu_core::types::{Hex256, Outpoint, PubKey, Sig, TxInput, TxOutput};

    fn oid(byte: u8) -> ObjectId {
        Hex256([byte; 32])
    }

    fn outpoint(byte: u8, index: u64) -> Outpoint {
        Outpoint { txid: oid(byte), index }
    }

    fn spend(spends: &[Outpoint], values: &[u64]) -> Transaction {
        Transaction {
            inputs: Some(
                spends
                    .iter()
                    .map(|op| TxInput {
                        outpoint: op.clone(),
                        sig: Sig([0; 64]),
                    })
                    .collect(),
            ),
            height: None,
            outputs: values
                .iter()
                .map(|v| TxOutput {
                    pubkey: PubKey([0xaa; 32]),
                    value: *v,
                })
                .collect(),
        }
    }

    fn base_with(entries: &[(Outpoint, u64)]) -> UtxoSet {
        entries.iter().cloned().collect()
    }

    #[test]
    fn apply_extends_list_and_view() {
        let mut pool = Mempool::new(base_with(&[(outpoint(1, 0), 50)]));
        let tx = spend(&[outpoint(1, 0)], &[40]);
        pool.try_apply(&oid(2), &tx).unwrap();

        assert_eq!(pool.txids(), vec![oid(2)]);
        assert!(pool.utxo_view().contains_key(&outpoint(2, 0)));
        assert!(!pool.utxo_view().contains_key(&outpoint(1, 0)));
    }

    #[test]
    fn chained_spends_apply_in_order() {
        let mut pool = Mempool::new(base_with(&[(outpoint(1, 0), 50)]));
        pool.try_apply(&oid(2), &spend(&[outpoint(1, 0)], &[40]))
            .unwrap();
        pool.try_apply(&oid(3), &spend(&[outpoint(2, 0)], &[30]))
            .unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool.utxo_view().contains_key(&outpoint(3, 0)));
    }

    #[test]
    fn double_spend_within_pool_rejected() {
        let mut pool = Mempool::new(base_with(&[(outpoint(1, 0), 50)]));
        pool.try_apply(&oid(2), &spend(&[outpoint(1, 0)], &[40]))
            .unwrap();
        let err = pool
            .try_apply(&oid(3), &spend(&[outpoint(1, 0)], &[35]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidTxOutpoint(_)));
        assert_eq!(pool.txids(), vec![oid(2)]);
    }

    #[test]
    fn reapply_is_idempotent() {
        let mut pool = Mempool::new(base_with(&[(outpoint(1, 0), 50)]));
        let tx = spend(&[outpoint(1, 0)], &[40]);
        pool.try_apply(&oid(2), &tx).unwrap();
        pool.try_apply(&oid(2), &tx).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn coinbase_not_eligible() {
        let mut pool = Mempool::new(UtxoSet::new());
        let coinbase = Transaction {
            inputs: None,
            height: Some(1),
            outputs: vec![TxOutput {
                pubkey: PubKey([0xaa; 32]),
                value: 50,
            }],
        };
        assert!(pool.try_apply(&oid(2), &coinbase).is_err());
        assert!(pool.is_empty());
    }
}
