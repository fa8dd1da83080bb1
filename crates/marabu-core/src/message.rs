//! Wire messages: line-delimited JSON objects discriminated by `type`.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ProtocolError};
use crate::types::{Object, ObjectId};

/// One wire message. Serialized as a single JSON line; the variant name,
/// lowercased, is the `type` field.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Hello {
        version: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },
    Error {
        name: ErrorCode,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    GetPeers,
    Peers {
        peers: Vec<String>,
    },
    GetObject {
        objectid: ObjectId,
    },
    IHaveObject {
        objectid: ObjectId,
    },
    Object {
        object: Object,
    },
    GetMempool,
    Mempool {
        txids: Vec<ObjectId>,
    },
    GetChaintip,
    Chaintip {
        blockid: ObjectId,
    },
}

impl Message {
    /// The `error` message reporting a protocol failure.
    pub fn from_error(err: &ProtocolError) -> Self {
        Message::Error {
            name: err.code(),
            description: Some(err.to_string()),
        }
    }
}
