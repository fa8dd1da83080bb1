//! Node-level errors.

use marabu_core::error::ProtocolError;
use thiserror::Error;

/// Failures outside the wire protocol: storage and socket plumbing.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<NodeError> for ProtocolError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::Protocol(e) => e,
            other => ProtocolError::Internal(other.to_string()),
        }
    }
}
