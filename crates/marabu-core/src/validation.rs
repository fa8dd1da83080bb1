//! Transaction validation.
//!
//! Two levels, following the split between context-free and store-backed
//! checks:
//!
//! - **Shape** ([`check_transaction_shape`], [`check_block_shape`]):
//!   rejects objects that parse but violate the schema's semantic rules
//!   (coinbase/regular exclusivity, output counts, annotation limits).
//!   Failures are `INVALID_FORMAT`.
//! - **Contextual** ([`validate_transaction`]): resolves every input against
//!   stored transactions, verifies Ed25519 signatures over the signable
//!   form, and checks value conservation.
//!
//! Block-level validation (proof of work, replay, coinbase rules) lives in
//! the node crate because it needs storage and the object fetcher.

use std::collections::HashSet;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde_json::Value;

use crate::canon;
use crate::error::ProtocolError;
use crate::params::ChainParams;
use crate::types::{Block, Object, ObjectId, PubKey, Sig, Transaction};

/// Maximum byte length of the `miner` and `note` annotations and of each
/// `studentids` entry.
const MAX_ANNOTATION_BYTES: usize = 128;

/// Maximum number of `studentids` entries.
const MAX_STUDENT_IDS: usize = 10;

/// Summary of a successfully validated regular transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTx {
    /// Total value of all spent inputs in picocoin.
    pub total_input: u64,
    /// Total value of all created outputs in picocoin.
    pub total_output: u64,
    /// Transaction fee in picocoin (`total_input - total_output`).
    pub fee: u64,
}

/// Reject transactions that are neither well-formed coinbase nor
/// well-formed regular transactions.
pub fn check_transaction_shape(tx: &Transaction) -> Result<(), ProtocolError> {
    match (&tx.inputs, tx.height) {
        (Some(_), Some(_)) => Err(ProtocolError::InvalidFormat(
            "transaction has both inputs and height".into(),
        )),
        (None, None) => Err(ProtocolError::InvalidFormat(
            "transaction has neither inputs nor height".into(),
        )),
        (Some(inputs), None) => {
            if inputs.is_empty() {
                return Err(ProtocolError::InvalidFormat(
                    "transaction has no inputs".into(),
                ));
            }
            Ok(())
        }
        (None, Some(_)) => {
            if tx.outputs.len() != 1 {
                return Err(ProtocolError::InvalidFormat(
                    "coinbase transaction must have exactly one output".into(),
                ));
            }
            Ok(())
        }
    }
}

fn check_annotation(field: &str, value: &str) -> Result<(), ProtocolError> {
    if value.len() > MAX_ANNOTATION_BYTES {
        return Err(ProtocolError::InvalidFormat(format!(
            "{field} exceeds {MAX_ANNOTATION_BYTES} bytes"
        )));
    }
    if !value.bytes().all(|b| (0x20..=0x7e).contains(&b)) {
        return Err(ProtocolError::InvalidFormat(format!(
            "{field} must be printable ASCII"
        )));
    }
    Ok(())
}

/// Reject blocks whose schema-level constraints fail: wrong `T` literal or
/// out-of-bounds annotations.
pub fn check_block_shape(block: &Block, params: &ChainParams) -> Result<(), ProtocolError> {
    if block.target != params.target {
        return Err(ProtocolError::InvalidFormat(
            "block carries the wrong target T".into(),
        ));
    }
    if let Some(miner) = &block.miner {
        check_annotation("miner", miner)?;
    }
    if let Some(note) = &block.note {
        check_annotation("note", note)?;
    }
    if let Some(ids) = &block.studentids {
        if ids.len() > MAX_STUDENT_IDS {
            return Err(ProtocolError::InvalidFormat(format!(
                "studentids exceeds {MAX_STUDENT_IDS} entries"
            )));
        }
        for id in ids {
            check_annotation("studentids entry", id)?;
        }
    }
    Ok(())
}

/// The transaction's signable form: the full object with every input's
/// `sig` replaced by JSON null, built as a value mutation so the canonical
/// bytes are exactly what signers produced.
pub fn signable_value(tx: &Transaction) -> Result<Value, ProtocolError> {
    let mut value =
        serde_json::to_value(Object::Transaction(tx.clone())).map_err(ProtocolError::internal)?;
    if let Some(inputs) = value.get_mut("inputs").and_then(Value::as_array_mut) {
        for input in inputs {
            if let Some(map) = input.as_object_mut() {
                map.insert("sig".into(), Value::Null);
            }
        }
    }
    Ok(value)
}

/// The canonical UTF-8 bytes a signer commits to.
pub fn signing_bytes(tx: &Transaction) -> Result<Vec<u8>, ProtocolError> {
    Ok(canon::canonical_json(&signable_value(tx)?).into_bytes())
}

/// Verify one Ed25519 signature over the signable bytes.
pub fn verify_signature(
    message: &[u8],
    pubkey: &PubKey,
    sig: &Sig,
) -> Result<(), ProtocolError> {
    let key = VerifyingKey::from_bytes(&pubkey.0).map_err(|_| {
        ProtocolError::InvalidTxSignature(format!("{pubkey} is not a valid Ed25519 public key"))
    })?;
    let signature = Signature::from_bytes(&sig.0);
    key.verify(message, &signature)
        .map_err(|_| ProtocolError::InvalidTxSignature("signature verification failed".into()))
}

/// Validate a transaction against stored objects.
///
/// The `resolve` function looks up a previously accepted object by id; it
/// returns `Ok(None)` for unknown ids and `Err` for storage failures.
/// Coinbase transactions have no inputs to resolve and short-circuit to a
/// zero-fee summary after the shape check — their reward bound is enforced
/// during block validation.
pub fn validate_transaction<F>(tx: &Transaction, resolve: F) -> Result<ValidatedTx, ProtocolError>
where
    F: Fn(&ObjectId) -> Result<Option<Object>, ProtocolError>,
{
    check_transaction_shape(tx)?;

    let total_output = tx
        .total_output_value()
        .ok_or_else(|| ProtocolError::InvalidTxConservation("output value overflow".into()))?;

    let inputs = match &tx.inputs {
        Some(inputs) => inputs,
        None => {
            return Ok(ValidatedTx {
                total_input: 0,
                total_output,
                fee: 0,
            });
        }
    };

    let message = signing_bytes(tx)?;
    let mut seen = HashSet::with_capacity(inputs.len());
    let mut total_input: u64 = 0;

    for input in inputs {
        if !seen.insert(&input.outpoint) {
            return Err(ProtocolError::InvalidTxConservation(format!(
                "duplicate outpoint {}",
                input.outpoint
            )));
        }

        let source = resolve(&input.outpoint.txid)?.ok_or_else(|| {
            ProtocolError::UnknownObject(input.outpoint.txid.to_string())
        })?;
        let source_tx = source.as_transaction().ok_or_else(|| {
            ProtocolError::InvalidTxOutpoint(format!(
                "outpoint {} references a block",
                input.outpoint
            ))
        })?;
        let output = usize::try_from(input.outpoint.index)
            .ok()
            .and_then(|i| source_tx.outputs.get(i))
            .ok_or_else(|| {
                ProtocolError::InvalidTxOutpoint(format!(
                    "outpoint {} is out of range",
                    input.outpoint
                ))
            })?;

        verify_signature(&message, &output.pubkey, &input.sig)?;

        total_input = total_input
            .checked_add(output.value)
            .ok_or_else(|| ProtocolError::InvalidTxConservation("input value overflow".into()))?;
    }

    if total_input < total_output {
        return Err(ProtocolError::InvalidTxConservation(format!(
            "inputs {total_input} < outputs {total_output}"
        )));
    }

    Ok(ValidatedTx {
        total_input,
        total_output,
        fee: total_input - total_output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Hex256, Outpoint, TxInput, TxOutput};
    use ed25519_dalek::{Signer, SigningKey};
    use std::collections::HashMap;

    // --- Helpers ---

    fn keypair(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn pubkey(key: &SigningKey) -> PubKey {
        PubKey(key.verifying_key().to_bytes())
    }

    fn coinbase(key: &SigningKey, height: u64, value: u64) -> Transaction {
        Transaction {
            inputs: None,
            height: Some(height),
            outputs: vec![TxOutput {
                pubkey: pubkey(key),
                value,
            }],
        }
    }

    /// Build a regular transaction spending the given outpoints and sign
    /// every input with `key`.
    fn signed_tx(key: &SigningKey, spends: &[Outpoint], outputs: &[(PubKey, u64)]) -> Transaction {
        let mut tx = Transaction {
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
            outputs: outputs
                .iter()
                .map(|(pk, v)| TxOutput { pubkey: *pk, value: *v })
                .collect(),
        };
        let message = signing_bytes(&tx).unwrap();
        let sig = Sig(key.sign(&message).to_bytes());
        for input in tx.inputs.as_mut().unwrap() {
            input.sig = sig;
        }
        tx
    }

    fn store_of(objects: &[(ObjectId, Object)]) -> HashMap<ObjectId, Object> {
        objects.iter().cloned().collect()
    }

    fn resolver(
        map: &HashMap<ObjectId, Object>,
    ) -> impl Fn(&ObjectId) -> Result<Option<Object>, ProtocolError> + '_ {
        |id| Ok(map.get(id).cloned())
    }

    fn oid(byte: u8) -> ObjectId {
        Hex256([byte; 32])
    }

    // --- Shape checks ---

    #[test]
    fn shape_rejects_both_inputs_and_height() {
        let key = keypair(1);
        let mut tx = coinbase(&key, 0, 50);
        tx.inputs = Some(vec![]);
        assert!(matches!(
            check_transaction_shape(&tx).unwrap_err(),
            ProtocolError::InvalidFormat(_)
        ));
    }

    #[test]
    fn shape_rejects_neither_inputs_nor_height() {
        let tx = Transaction {
            inputs: None,
            height: None,
            outputs: vec![],
        };
        assert!(matches!(
            check_transaction_shape(&tx).unwrap_err(),
            ProtocolError::InvalidFormat(_)
        ));
    }

    #[test]
    fn shape_rejects_empty_inputs() {
        let tx = Transaction {
            inputs: Some(vec![]),
            height: None,
            outputs: vec![],
        };
        assert!(check_transaction_shape(&tx).is_err());
    }

    #[test]
    fn shape_rejects_multi_output_coinbase() {
        let key = keypair(1);
        let mut tx = coinbase(&key, 0, 50);
        tx.outputs.push(tx.outputs[0].clone());
        assert!(check_transaction_shape(&tx).is_err());
    }

    #[test]
    fn shape_accepts_coinbase() {
        let key = keypair(1);
        assert!(check_transaction_shape(&coinbase(&key, 0, 50)).is_ok());
    }

    // --- Block shape ---

    fn block_with(params: &ChainParams) -> Block {
        Block {
            txids: vec![],
            nonce: Hex256([0; 32]),
            previd: None,
            created: 0,
            target: params.target,
            miner: None,
            note: None,
            studentids: None,
        }
    }

    #[test]
    fn block_shape_rejects_wrong_target() {
        let params = ChainParams::mainnet();
        let mut block = block_with(&params);
        block.target = Hex256([0xff; 32]);
        assert!(check_block_shape(&block, &params).is_err());
    }

    #[test]
    fn block_shape_rejects_oversized_note() {
        let params = ChainParams::mainnet();
        let mut block = block_with(&params);
        block.note = Some("x".repeat(129));
        assert!(check_block_shape(&block, &params).is_err());
    }

    #[test]
    fn block_shape_rejects_non_ascii_miner() {
        let params = ChainParams::mainnet();
        let mut block = block_with(&params);
        block.miner = Some("Märabu".into());
        assert!(check_block_shape(&block, &params).is_err());
    }

    #[test]
    fn block_shape_accepts_plain_annotations() {
        let params = ChainParams::mainnet();
        let mut block = block_with(&params);
        block.miner = Some("Marabu-Core".into());
        block.note = Some("hello world".into());
        block.studentids = Some(vec!["alice".into(), "bob".into()]);
        assert!(check_block_shape(&block, &params).is_ok());
    }

    // --- Signable form ---

    #[test]
    fn signable_form_nulls_every_sig() {
        let key = keypair(1);
        let tx = signed_tx(
            &key,
            &[
                Outpoint { txid: oid(1), index: 0 },
                Outpoint { txid: oid(2), index: 0 },
            ],
            &[(pubkey(&key), 10)],
        );
        let value = signable_value(&tx).unwrap();
        for input in value["inputs"].as_array().unwrap() {
            assert!(input["sig"].is_null());
        }
        assert_eq!(value["type"], "transaction");
    }

    #[test]
    fn signing_bytes_ignore_existing_sigs() {
        let key = keypair(1);
        let op = Outpoint { txid: oid(1), index: 0 };
        let a = signed_tx(&key, &[op.clone()], &[(pubkey(&key), 10)]);
        let mut b = a.clone();
        b.inputs.as_mut().unwrap()[0].sig = Sig([0xee; 64]);
        assert_eq!(signing_bytes(&a).unwrap(), signing_bytes(&b).unwrap());
    }

    // --- Contextual validation ---

    /// A coinbase funding `key` with `value`, plus its id.
    fn funding(key: &SigningKey, value: u64) -> (ObjectId, Object) {
        let object = Object::Transaction(coinbase(key, 0, value));
        let id = object.id().unwrap();
        (id, object)
    }

    #[test]
    fn valid_spend_accepted_with_fee() {
        let key = keypair(1);
        let (fund_id, fund) = funding(&key, 50);
        let store = store_of(&[(fund_id, fund)]);
        let tx = signed_tx(
            &key,
            &[Outpoint { txid: fund_id, index: 0 }],
            &[(pubkey(&key), 45)],
        );
        let summary = validate_transaction(&tx, resolver(&store)).unwrap();
        assert_eq!(summary.total_input, 50);
        assert_eq!(summary.total_output, 45);
        assert_eq!(summary.fee, 5);
    }

    #[test]
    fn unknown_source_transaction() {
        let key = keypair(1);
        let store = HashMap::new();
        let tx = signed_tx(
            &key,
            &[Outpoint { txid: oid(9), index: 0 }],
            &[(pubkey(&key), 1)],
        );
        assert!(matches!(
            validate_transaction(&tx, resolver(&store)).unwrap_err(),
            ProtocolError::UnknownObject(_)
        ));
    }

    #[test]
    fn out_of_range_index() {
        let key = keypair(1);
        let (fund_id, fund) = funding(&key, 50);
        let store = store_of(&[(fund_id, fund)]);
        let tx = signed_tx(
            &key,
            &[Outpoint { txid: fund_id, index: 1 }],
            &[(pubkey(&key), 1)],
        );
        assert!(matches!(
            validate_transaction(&tx, resolver(&store)).unwrap_err(),
            ProtocolError::InvalidTxOutpoint(_)
        ));
    }

    #[test]
    fn wrong_key_signature_rejected() {
        let owner = keypair(1);
        let thief = keypair(2);
        let (fund_id, fund) = funding(&owner, 50);
        let store = store_of(&[(fund_id, fund)]);
        let tx = signed_tx(
            &thief,
            &[Outpoint { txid: fund_id, index: 0 }],
            &[(pubkey(&thief), 50)],
        );
        assert!(matches!(
            validate_transaction(&tx, resolver(&store)).unwrap_err(),
            ProtocolError::InvalidTxSignature(_)
        ));
    }

    #[test]
    fn tampered_sig_byte_rejected() {
        let key = keypair(1);
        let (fund_id, fund) = funding(&key, 50);
        let store = store_of(&[(fund_id, fund)]);
        let mut tx = signed_tx(
            &key,
            &[Outpoint { txid: fund_id, index: 0 }],
            &[(pubkey(&key), 45)],
        );
        tx.inputs.as_mut().unwrap()[0].sig.0[3] ^= 0x01;
        assert!(matches!(
            validate_transaction(&tx, resolver(&store)).unwrap_err(),
            ProtocolError::InvalidTxSignature(_)
        ));
    }

    #[test]
    fn tampered_output_after_signing_rejected() {
        let key = keypair(1);
        let (fund_id, fund) = funding(&key, 50);
        let store = store_of(&[(fund_id, fund)]);
        let mut tx = signed_tx(
            &key,
            &[Outpoint { txid: fund_id, index: 0 }],
            &[(pubkey(&key), 45)],
        );
        tx.outputs[0].value = 50;
        assert!(matches!(
            validate_transaction(&tx, resolver(&store)).unwrap_err(),
            ProtocolError::InvalidTxSignature(_)
        ));
    }

    #[test]
    fn duplicate_outpoints_fail_conservation() {
        let key = keypair(1);
        let (fund_id, fund) = funding(&key, 50);
        let store = store_of(&[(fund_id, fund)]);
        let op = Outpoint { txid: fund_id, index: 0 };
        let tx = signed_tx(&key, &[op.clone(), op], &[(pubkey(&key), 60)]);
        assert!(matches!(
            validate_transaction(&tx, resolver(&store)).unwrap_err(),
            ProtocolError::InvalidTxConservation(_)
        ));
    }

    #[test]
    fn overspending_fails_conservation() {
        let key = keypair(1);
        let (fund_id, fund) = funding(&key, 50);
        let store = store_of(&[(fund_id, fund)]);
        let tx = signed_tx(
            &key,
            &[Outpoint { txid: fund_id, index: 0 }],
            &[(pubkey(&key), 51)],
        );
        assert!(matches!(
            validate_transaction(&tx, resolver(&store)).unwrap_err(),
            ProtocolError::InvalidTxConservation(_)
        ));
    }

    #[test]
    fn exact_spend_zero_fee_accepted() {
        let key = keypair(1);
        let (fund_id, fund) = funding(&key, 50);
        let store = store_of(&[(fund_id, fund)]);
        let tx = signed_tx(
            &key,
            &[Outpoint { txid: fund_id, index: 0 }],
            &[(pubkey(&key), 50)],
        );
        assert_eq!(validate_transaction(&tx, resolver(&store)).unwrap().fee, 0);
    }

    #[test]
    fn outpoint_referencing_block_rejected() {
        let key = keypair(1);
        let params = ChainParams::mainnet();
        let block = Object::Block(block_with(&params));
        let block_id = block.id().unwrap();
        let store = store_of(&[(block_id, block)]);
        let tx = signed_tx(
            &key,
            &[Outpoint { txid: block_id, index: 0 }],
            &[(pubkey(&key), 1)],
        );
        assert!(matches!(
            validate_transaction(&tx, resolver(&store)).unwrap_err(),
            ProtocolError::InvalidTxOutpoint(_)
        ));
    }

    #[test]
    fn coinbase_short_circuits_to_zero_fee() {
        let key = keypair(1);
        let store = HashMap::new();
        let summary = validate_transaction(&coinbase(&key, 3, 50), resolver(&store)).unwrap();
        assert_eq!(summary.fee, 0);
        assert_eq!(summary.total_output, 50);
    }

    #[test]
    fn multi_input_different_keys() {
        let alice = keypair(1);
        let bob = keypair(2);
        let (fund_a, obj_a) = funding(&alice, 30);
        let (fund_b, obj_b) = funding(&bob, 20);
        let store = store_of(&[(fund_a, obj_a), (fund_b, obj_b)]);

        let mut tx = Transaction {
            inputs: Some(vec![
                TxInput {
                    outpoint: Outpoint { txid: fund_a, index: 0 },
                    sig: Sig([0; 64]),
                },
                TxInput {
                    outpoint: Outpoint { txid: fund_b, index: 0 },
                    sig: Sig([0; 64]),
                },
            ]),
            height: None,
            outputs: vec![TxOutput {
                pubkey: pubkey(&alice),
                value: 45,
            }],
        };
        let message = signing_bytes(&tx).unwrap();
        tx.inputs.as_mut().unwrap()[0].sig = Sig(alice.sign(&message).to_bytes());
        tx.inputs.as_mut().unwrap()[1].sig = Sig(bob.sign(&message).to_bytes());

        let summary = validate_transaction(&tx, resolver(&store)).unwrap();
        assert_eq!(summary.total_input, 50);
        assert_eq!(summary.fee, 5);
    }
}
