//! Core protocol types: transactions, blocks, and their hex-string atoms.
//!
//! All monetary values are in picocoin (1 coin = 10^12 picocoin) and use
//! `u64` per protocol convention. Hex fields are strict: exactly the
//! required length, lowercase only — anything else fails deserialization
//! and is reported to the peer as `INVALID_FORMAT`.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::canon;
use crate::error::ProtocolError;

/// Failure to parse a fixed-length lowercase hex string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HexParseError {
    #[error("expected {expected} hex characters, got {got}")]
    BadLength { expected: usize, got: usize },
    #[error("expected lowercase hex characters only")]
    BadCharacter,
}

fn decode_fixed_hex<const N: usize>(s: &str) -> Result<[u8; N], HexParseError> {
    if s.len() != 2 * N {
        return Err(HexParseError::BadLength {
            expected: 2 * N,
            got: s.len(),
        });
    }
    if !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return Err(HexParseError::BadCharacter);
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(s, &mut out).map_err(|_| HexParseError::BadCharacter)?;
    Ok(out)
}

/// A 32-byte value carried on the wire as 64 lowercase hex characters.
///
/// Used for object ids (Blake2s-256 of the canonical serialization), block
/// nonces, and the proof-of-work target. Ordering is big-endian
/// lexicographic, which coincides with lexicographic comparison of the hex
/// strings — this is what the PoW check relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hex256(pub [u8; 32]);

/// An object id: the Blake2s-256 digest of an object's canonical JSON.
pub type ObjectId = Hex256;

impl fmt::Display for Hex256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hex256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hex256({self})")
    }
}

impl FromStr for Hex256 {
    type Err = HexParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed_hex(s).map(Self)
    }
}

impl Serialize for Hex256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hex256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// An Ed25519 public key, carried as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PubKey(pub [u8; 32]);

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({self})")
    }
}

impl FromStr for PubKey {
    type Err = HexParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed_hex(s).map(Self)
    }
}

impl Serialize for PubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// An Ed25519 signature, carried as 128 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sig(pub [u8; 64]);

impl fmt::Display for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({self})")
    }
}

impl FromStr for Sig {
    type Err = HexParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed_hex(s).map(Self)
    }
}

impl Serialize for Sig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Sig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(deny_unknown_fields)]
pub struct Outpoint {
    /// Id of the transaction containing the referenced output.
    pub txid: ObjectId,
    /// Index of the output within that transaction.
    pub index: u64,
}

impl fmt::Display for Outpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TxInput {
    /// The outpoint being spent.
    pub outpoint: Outpoint,
    /// Ed25519 signature over the transaction's signable form.
    pub sig: Sig,
}

/// A transaction output, creating a new UTXO.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TxOutput {
    /// Ed25519 public key of the recipient.
    pub pubkey: PubKey,
    /// Value in picocoin.
    pub value: u64,
}

/// A transaction: either regular (`inputs` present) or coinbase (`height`
/// present). The two shapes are mutually exclusive; presence of both or
/// neither is rejected by
/// [`check_transaction_shape`](crate::validation::check_transaction_shape).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Transaction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<TxInput>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Whether this is a coinbase transaction (`height` present, no inputs).
    pub fn is_coinbase(&self) -> bool {
        self.height.is_some() && self.inputs.is_none()
    }

    /// Sum of all output values. `None` on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }
}

/// A block: an ordered list of transaction ids under a proof of work.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Block {
    pub txids: Vec<ObjectId>,
    pub nonce: Hex256,
    /// Id of the parent block; `null` only on the genesis block.
    pub previd: Option<ObjectId>,
    /// Unix timestamp in seconds.
    pub created: u64,
    /// The fixed proof-of-work target.
    #[serde(rename = "T")]
    pub target: Hex256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub miner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub studentids: Option<Vec<String>>,
}

/// A gossiped object: transaction or block, discriminated by the `type`
/// field. Deserialization is strict — unknown `type` values and unknown
/// fields within either shape are rejected.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Object {
    Transaction(Transaction),
    Block(Block),
}

// Hand-written so that strictness is exact: the `type` key is removed and
// the remaining fields must deserialize into the variant's schema with
// `deny_unknown_fields` in effect.
impl<'de> Deserialize<'de> for Object {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut value = Value::deserialize(deserializer)?;
        let map = value
            .as_object_mut()
            .ok_or_else(|| D::Error::custom("object must be a JSON map"))?;
        let tag = map
            .remove("type")
            .ok_or_else(|| D::Error::custom("object is missing its type field"))?;
        let tag = tag
            .as_str()
            .ok_or_else(|| D::Error::custom("object type must be a string"))?
            .to_owned();
        let rest = Value::Object(std::mem::take(map));
        match tag.as_str() {
            "transaction" => serde_json::from_value(rest)
                .map(Object::Transaction)
                .map_err(D::Error::custom),
            "block" => serde_json::from_value(rest)
                .map(Object::Block)
                .map_err(D::Error::custom),
            other => Err(D::Error::custom(format!("unknown object type `{other}`"))),
        }
    }
}

impl Object {
    /// The object's id: Blake2s-256 over the canonical serialization.
    pub fn id(&self) -> Result<ObjectId, ProtocolError> {
        let value = serde_json::to_value(self).map_err(ProtocolError::internal)?;
        Ok(canon::hash_value(&value))
    }

    pub fn as_transaction(&self) -> Option<&Transaction> {
        match self {
            Object::Transaction(tx) => Some(tx),
            Object::Block(_) => None,
        }
    }

    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Object::Block(block) => Some(block),
            Object::Transaction(_) => None,
        }
    }
}
