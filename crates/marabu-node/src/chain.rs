//! Chain ancestry walks.
//!
//! Heights are not stored per block; they are recovered by following
//! `previd` links back to the genesis block, whose height is 0 by
//! definition. Every ancestor of a stored block is itself stored, because
//! blocks are only stored after their parents validated.

use marabu_core::error::ProtocolError;
use marabu_core::types::{Block, ObjectId};

use crate::storage::{ChainTip, Store};

fn parent_block(store: &Store, id: &ObjectId) -> Result<Block, ProtocolError> {
    store
        .get_block(id)?
        .ok_or_else(|| ProtocolError::internal(format!("ancestor block {id} missing from store")))
}

/// Height of a stored block: the number of `previd` links down to genesis.
pub fn height_of(store: &Store, id: &ObjectId) -> Result<u64, ProtocolError> {
    let mut height = 0u64;
    let mut block = parent_block(store, id)?;
    while let Some(previd) = block.previd {
        height += 1;
        block = parent_block(store, &previd)?;
    }
    Ok(height)
}

/// Transaction ids confirmed on the old tip's chain but not on the new
/// tip's chain, coinbases excluded.
///
/// Ordering: oldest forgotten block first, each block's transactions in
/// block order — the order in which a reorganized mempool re-applies them.
///
/// The common ancestor is found by lifting the deeper tip to the shallower
/// tip's height and then walking both chains back in lockstep until the
/// block ids agree; both chains root at genesis, so the walk terminates.
pub fn forgotten_txids(
    store: &Store,
    old: &ChainTip,
    new: &ChainTip,
) -> Result<Vec<ObjectId>, ProtocolError> {
    let mut old_cursor = (old.hash, old.block.clone(), old.height);
    let mut new_cursor = (new.hash, new.block.clone(), new.height);
    let mut forgotten_blocks: Vec<Block> = Vec::new();

    let step = |cursor: &mut (ObjectId, Block, u64)| -> Result<(), ProtocolError> {
        let previd = cursor.1.previd.ok_or_else(|| {
            ProtocolError::internal("chain walk descended past the genesis block")
        })?;
        cursor.1 = parent_block(store, &previd)?;
        cursor.0 = previd;
        cursor.2 -= 1;
        Ok(())
    };

    while new_cursor.2 > old_cursor.2 {
        step(&mut new_cursor)?;
    }
    while old_cursor.2 > new_cursor.2 {
        forgotten_blocks.push(old_cursor.1.clone());
        step(&mut old_cursor)?;
    }
    while old_cursor.0 != new_cursor.0 {
        forgotten_blocks.push(old_cursor.1.clone());
        step(&mut old_cursor)?;
        step(&mut new_cursor)?;
    }

    // Walked tip-first; replay wants oldest-first.
    forgotten_blocks.reverse();

    let mut txids = Vec::new();
    for block in &forgotten_blocks {
        for txid in &block.txids {
            let tx = store.get_transaction(txid)?.ok_or_else(|| {
                ProtocolError::internal(format!("confirmed transaction {txid} missing from store"))
            })?;
            if !tx.is_coinbase() {
                txids.push(*txid);
            }
        }
    }
    Ok(txids)
}
