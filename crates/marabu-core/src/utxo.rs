//! UTXO set arithmetic.
//!
//! A [`UtxoSet`] maps outpoints to their values. Blocks and the mempool both
//! evolve a set by applying transactions in order; persistence uses the
//! sorted [`Utxo`] entry form.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{ObjectId, Outpoint, Transaction};

/// An unspent transaction output in its persisted form.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    pub txid: ObjectId,
    pub index: u64,
    pub value: u64,
}

/// In-memory UTXO view: outpoint → value.
pub type UtxoSet = HashMap<Outpoint, u64>;

/// Convert a set to its persisted entry list, sorted by outpoint so the
/// stored JSON is deterministic.
pub fn to_entries(set: &UtxoSet) -> Vec<Utxo> {
    let mut entries: Vec<Utxo> = set
        .iter()
        .map(|(outpoint, value)| Utxo {
            txid: outpoint.txid,
            index: outpoint.index,
            value: *value,
        })
        .collect();
    entries.sort_by(|a, b| (a.txid, a.index).cmp(&(b.txid, b.index)));
    entries
}

/// Rebuild a set from its persisted entry list.
pub fn from_entries(entries: &[Utxo]) -> UtxoSet {
    entries
        .iter()
        .map(|utxo| {
            (
                Outpoint {
                    txid: utxo.txid,
                    index: utxo.index,
                },
                utxo.value,
            )
        })
        .collect()
}

/// Apply one transaction to a UTXO view, returning the fee it pays.
///
/// Every input's outpoint must be present in the view, else
/// `INVALID_TX_OUTPOINT` — and in that case the view is left unchanged, so
/// callers replaying a candidate list can drop the transaction and continue.
/// Coinbase transactions consume nothing and pay no fee.
pub fn apply_transaction(
    utxos: &mut UtxoSet,
    txid: &ObjectId,
    tx: &Transaction,
) -> Result<u64, ProtocolError> {
    let mut total_in: u64 = 0;

    if let Some(inputs) = &tx.inputs {
        // Check all inputs before mutating anything.
        let mut seen: HashSet<&Outpoint> = HashSet::with_capacity(inputs.len());
        for input in inputs {
            if !seen.insert(&input.outpoint) {
                return Err(ProtocolError::InvalidTxOutpoint(format!(
                    "outpoint {} spent twice by transaction {txid}",
                    input.outpoint
                )));
            }
            let value = utxos.get(&input.outpoint).ok_or_else(|| {
                ProtocolError::InvalidTxOutpoint(format!(
                    "outpoint {} is not in the UTXO set",
                    input.outpoint
                ))
            })?;
            total_in = total_in
                .checked_add(*value)
                .ok_or_else(|| ProtocolError::internal("input value overflow"))?;
        }
        for input in inputs {
            utxos.remove(&input.outpoint);
        }
    }

    for (index, output) in tx.outputs.iter().enumerate() {
        utxos.insert(
            Outpoint {
                txid: *txid,
                index: index as u64,
            },
            output.value,
        );
    }

    if tx.inputs.is_none() {
        return Ok(0);
    }
    let total_out = tx
        .total_output_value()
        .ok_or_else(|| ProtocolError::internal("output value overflow"))?;
    total_in
        .checked_sub(total_out)
        .ok_or_else(|| ProtocolError::internal("transaction applied with negative fee"))
}
