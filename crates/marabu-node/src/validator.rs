//! Block validation.
//!
//! A candidate block is checked in protocol order: proof of work,
//! timestamps, the genesis rule, parent resolution, transaction
//! resolution, coinbase placement, UTXO replay from the parent's set, and
//! the coinbase value/height rules. Parents and referenced transactions
//! that are not yet local are resolved through the [`ObjectSource`]
//! capability, which gossips `getobject` and waits with a bounded timeout;
//! an unresolvable dependency rejects the whole block.
//!
//! Validation computes but does not persist: the caller commits the
//! post-state UTXO set and any chaintip change.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::task::JoinSet;

use marabu_core::error::ProtocolError;
use marabu_core::params::ChainParams;
use marabu_core::types::{Block, Object, ObjectId, Outpoint, Transaction};
use marabu_core::utxo::{self, UtxoSet};
use marabu_core::validation;

use crate::chain;
use crate::fetcher::ObjectSource;
use crate::storage::Store;

/// Outcome of a successful block validation.
#[derive(Debug)]
pub struct BlockAcceptance {
    /// Height of the validated block (genesis = 0).
    pub height: u64,
    /// UTXO set after applying the block's transactions.
    pub utxo_after: UtxoSet,
}

/// Wallclock seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Validate `block` (whose id is `id`) against the current stores,
/// resolving missing dependencies through `source`.
pub async fn validate_block(
    store: &Store,
    params: &ChainParams,
    source: Arc<dyn ObjectSource>,
    id: &ObjectId,
    block: &Block,
) -> Result<BlockAcceptance, ProtocolError> {
    validation::check_block_shape(block, params)?;

    if *id >= params.target {
        return Err(ProtocolError::InvalidBlockPow(format!(
            "block hash {id} is not below the target"
        )));
    }

    let now = unix_now();
    if block.created > now {
        return Err(ProtocolError::InvalidBlockTimestamp(format!(
            "block is from the future: created {} > now {now}",
            block.created
        )));
    }

    // Resolve the parent and establish this block's height.
    let (height, mut utxos) = match &block.previd {
        None => {
            if *id != params.genesis_id {
                return Err(ProtocolError::InvalidGenesis(format!(
                    "block {id} has null previd but is not the genesis block"
                )));
            }
            (0, UtxoSet::new())
        }
        Some(previd) => {
            let parent = source.ensure(previd).await?;
            let parent_block = parent.as_block().ok_or_else(|| {
                ProtocolError::InvalidFormat(format!("previd {previd} is not a block"))
            })?;
            if parent_block.created >= block.created {
                return Err(ProtocolError::InvalidBlockTimestamp(format!(
                    "created {} is not after parent's {}",
                    block.created, parent_block.created
                )));
            }
            let entries = store.utxo_after(previd).map_err(ProtocolError::from)?.ok_or_else(|| {
                ProtocolError::internal(format!("no UTXO set stored for parent {previd}"))
            })?;
            let parent_height = chain::height_of(store, previd)?;
            (parent_height + 1, utxo::from_entries(&entries))
        }
    };

    let txs = resolve_transactions(source, &block.txids).await?;

    // Only the first transaction may be a coinbase.
    let mut coinbase: Option<&Transaction> = None;
    for (i, tx) in txs.iter().enumerate() {
        if tx.is_coinbase() {
            if i != 0 {
                return Err(ProtocolError::InvalidBlockCoinbase(format!(
                    "coinbase at position {i}, only position 0 is allowed"
                )));
            }
            coinbase = Some(tx);
        }
    }

    // Replay against the parent's UTXO set, accumulating fees.
    let mut fees: u64 = 0;
    for (txid, tx) in block.txids.iter().zip(&txs) {
        let fee = utxo::apply_transaction(&mut utxos, txid, tx)?;
        fees = fees
            .checked_add(fee)
            .ok_or_else(|| ProtocolError::internal("fee overflow"))?;
    }

    if let Some(cb) = coinbase {
        let cb_txid = block.txids[0];
        let cb_outpoint = Outpoint { txid: cb_txid, index: 0 };
        if !utxos.contains_key(&cb_outpoint) {
            return Err(ProtocolError::InvalidTxOutpoint(
                "coinbase output is spent within its own block".into(),
            ));
        }

        let reward_cap = params
            .block_reward
            .checked_add(fees)
            .ok_or_else(|| ProtocolError::internal("reward overflow"))?;
        let minted = cb
            .outputs
            .first()
            .map(|out| out.value)
            .ok_or_else(|| ProtocolError::internal("stored coinbase has no output"))?;
        if minted > reward_cap {
            return Err(ProtocolError::InvalidBlockCoinbase(format!(
                "coinbase value {minted} exceeds reward plus fees {reward_cap}"
            )));
        }

        if cb.height != Some(height) {
            return Err(ProtocolError::InvalidBlockCoinbase(format!(
                "coinbase height {:?} does not match block height {height}",
                cb.height
            )));
        }
    }

    Ok(BlockAcceptance {
        height,
        utxo_after: utxos,
    })
}

/// Resolve every listed txid concurrently, preserving order. Each resolved
/// object must be a transaction.
async fn resolve_transactions(
    source: Arc<dyn ObjectSource>,
    txids: &[ObjectId],
) -> Result<Vec<Transaction>, ProtocolError> {
    let mut tasks = JoinSet::new();
    for (index, txid) in txids.iter().enumerate() {
        let source = source.clone();
        let txid = *txid;
        tasks.spawn(async move { (index, txid, source.ensure(&txid).await) });
    }

    let mut txs: Vec<Option<Transaction>> = vec![None; txids.len()];
    while let Some(joined) = tasks.join_next().await {
        let (index, txid, result) = joined.map_err(ProtocolError::internal)?;
        match result? {
            Object::Transaction(tx) => txs[index] = Some(tx),
            Object::Block(_) => {
                return Err(ProtocolError::InvalidFormat(format!(
                    "txid {txid} references a block"
                )));
            }
        }
    }

    Ok(txs.into_iter().flatten().collect())
}
