//! Protocol error types and their wire-level error codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The twelve error codes of the wire protocol's `error` message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InternalError,
    InvalidFormat,
    UnknownObject,
    UnfindableObject,
    InvalidHandshake,
    InvalidTxOutpoint,
    InvalidTxSignature,
    InvalidTxConservation,
    InvalidBlockCoinbase,
    InvalidBlockTimestamp,
    InvalidBlockPow,
    InvalidGenesis,
}

/// A protocol failure, surfaced to the remote peer as an `error` message.
///
/// Each variant carries a human-readable description used as the wire
/// message's `description` field. Only [`InvalidFormat`](Self::InvalidFormat)
/// and [`InvalidHandshake`](Self::InvalidHandshake) close the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    #[error("unknown object: {0}")]
    UnknownObject(String),
    #[error("object could not be found: {0}")]
    UnfindableObject(String),
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("invalid transaction outpoint: {0}")]
    InvalidTxOutpoint(String),
    #[error("invalid transaction signature: {0}")]
    InvalidTxSignature(String),
    #[error("transaction does not conserve value: {0}")]
    InvalidTxConservation(String),
    #[error("invalid block coinbase: {0}")]
    InvalidBlockCoinbase(String),
    #[error("invalid block timestamp: {0}")]
    InvalidBlockTimestamp(String),
    #[error("insufficient proof of work: {0}")]
    InvalidBlockPow(String),
    #[error("invalid genesis block: {0}")]
    InvalidGenesis(String),
}

impl ProtocolError {
    /// The wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Internal(_) => ErrorCode::InternalError,
            Self::InvalidFormat(_) => ErrorCode::InvalidFormat,
            Self::UnknownObject(_) => ErrorCode::UnknownObject,
            Self::UnfindableObject(_) => ErrorCode::UnfindableObject,
            Self::InvalidHandshake(_) => ErrorCode::InvalidHandshake,
            Self::InvalidTxOutpoint(_) => ErrorCode::InvalidTxOutpoint,
            Self::InvalidTxSignature(_) => ErrorCode::InvalidTxSignature,
            Self::InvalidTxConservation(_) => ErrorCode::InvalidTxConservation,
            Self::InvalidBlockCoinbase(_) => ErrorCode::InvalidBlockCoinbase,
            Self::InvalidBlockTimestamp(_) => ErrorCode::InvalidBlockTimestamp,
            Self::InvalidBlockPow(_) => ErrorCode::InvalidBlockPow,
            Self::InvalidGenesis(_) => ErrorCode::InvalidGenesis,
        }
    }

    /// Whether the session delivering the offending message must be closed.
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::InvalidFormat(_) | Self::InvalidHandshake(_))
    }

    /// Wrap any displayable error as an internal error.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}
