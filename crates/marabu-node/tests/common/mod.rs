//! Shared builders for node-level tests: a test chain with a permissive
//! proof-of-work target, a crafted genesis block, keypairs, and signed
//! transactions.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::{Signer, SigningKey};
use tempfile::TempDir;

use marabu_core::params::{ChainParams, BLOCK_REWARD};
use marabu_core::types::{
    Block, Hex256, Object, ObjectId, Outpoint, PubKey, Sig, Transaction, TxInput, TxOutput,
};
use marabu_core::validation::signing_bytes;
use marabu_node_lib::{Node, NodeConfig};

/// Base timestamp for test chains, comfortably in the past.
pub const T0: u64 = 1_650_000_000;

/// A mid-range target: mining a block takes a couple of nonce increments,
/// and mining an invalid block (hash at or above the target) is just as
/// easy.
pub fn test_target() -> Hex256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0x80;
    Hex256(bytes)
}

pub fn keypair(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn pubkey(key: &SigningKey) -> PubKey {
    PubKey(key.verifying_key().to_bytes())
}

pub fn coinbase(key: &SigningKey, height: u64, value: u64) -> Transaction {
    Transaction {
        inputs: None,
        height: Some(height),
        outputs: vec![TxOutput {
            pubkey: pubkey(key),
            value,
        }],
    }
}

/// A regular transaction spending `spends`, with every input signed by
/// `key`.
pub fn signed_tx(key: &SigningKey, spends: &[Outpoint], outputs: &[(PubKey, u64)]) -> Transaction {
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
            .map(|(pk, v)| TxOutput {
                pubkey: *pk,
                value: *v,
            })
            .collect(),
    };
    let message = signing_bytes(&tx).expect("signable form");
    let sig = Sig(key.sign(&message).to_bytes());
    for input in tx.inputs.as_mut().expect("regular tx") {
        input.sig = sig;
    }
    tx
}

pub fn object_id(object: &Object) -> ObjectId {
    object.id().expect("object id")
}

pub fn tx_id(tx: &Transaction) -> ObjectId {
    object_id(&Object::Transaction(tx.clone()))
}

/// Build a block and grind its nonce until its hash is below the target
/// (`valid_pow = true`) or at/above it (`valid_pow = false`).
pub fn mine_block(
    previd: Option<ObjectId>,
    created: u64,
    txids: Vec<ObjectId>,
    valid_pow: bool,
) -> Block {
    let mut block = Block {
        txids,
        nonce: Hex256([0; 32]),
        previd,
        created,
        target: test_target(),
        miner: Some("test-rig".to_string()),
        note: None,
        studentids: None,
    };
    for nonce in 0u64.. {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&nonce.to_be_bytes());
        block.nonce = Hex256(bytes);
        let id = object_id(&Object::Block(block.clone()));
        if (id < test_target()) == valid_pow {
            return block;
        }
    }
    unreachable!("nonce space exhausted");
}

/// A genesis block plus the chain parameters that accept it.
pub fn test_chain() -> (Block, ChainParams) {
    let genesis = mine_block(None, T0, vec![], true);
    let params = ChainParams {
        genesis_id: object_id(&Object::Block(genesis.clone())),
        target: test_target(),
        block_reward: BLOCK_REWARD,
    };
    (genesis, params)
}

/// A node over a temporary database, with a short fetch timeout so tests
/// that exercise unfindable objects stay fast.
pub fn test_node(params: ChainParams) -> (TempDir, Arc<Node>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = NodeConfig {
        data_dir: dir.path().to_path_buf(),
        fetch_timeout: Duration::from_millis(200),
        params,
        ..NodeConfig::default()
    };
    let node = Node::new(config).expect("node");
    (dir, node)
}
