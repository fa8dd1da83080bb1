//! Protocol constants and chain parameters.
//!
//! [`ChainParams`] carries the values that differ between the public
//! network and test harnesses (crafted genesis blocks and permissive
//! targets make proof-of-work testable); everything else is a flat constant.

use std::time::Duration;

use crate::types::{Hex256, ObjectId};

/// Protocol version announced in `hello`.
pub const PROTOCOL_VERSION: &str = "0.9.0";

/// Agent string announced in `hello`.
pub const AGENT: &str = concat!("Marabu-Core ", env!("CARGO_PKG_VERSION"));

/// Default TCP port for the wire protocol.
pub const DEFAULT_PORT: u16 = 18018;

/// Maximum accepted line length, in bytes.
pub const MAX_MESSAGE_BYTES: usize = 100 * 1024;

/// Block subsidy in picocoin (50 coins of 10^12 picocoin each).
pub const BLOCK_REWARD: u64 = 50_000_000_000_000;

/// Time allowed for a peer to complete the handshake.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for a partial line to complete before the session closes.
pub const IDLE_LINE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for a `getobject` request to be answered by any peer.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of outgoing connections the dialer maintains.
pub const DEFAULT_TARGET_OUTBOUND: usize = 8;

/// Id of the public network's genesis block.
pub const GENESIS_ID: &str = "0000000052a0e645eca917ae1c196e0d0a4fb756747f29ef52594d68484bb5e2";

/// The fixed proof-of-work target.
pub const TARGET: &str = "00000000abc00000000000000000000000000000000000000000000000000000";

/// Whether a peer's announced version is acceptable (`0.9.x`).
pub fn version_compatible(version: &str) -> bool {
    match version.strip_prefix("0.9.") {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Consensus parameters of one chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainParams {
    /// The only block id allowed to carry `previd: null`.
    pub genesis_id: ObjectId,
    /// Block hashes must be strictly below this value.
    pub target: Hex256,
    /// Maximum coinbase value above collected fees, in picocoin.
    pub block_reward: u64,
}

impl ChainParams {
    /// Parameters of the public network.
    pub fn mainnet() -> Self {
        Self {
            genesis_id: GENESIS_ID.parse().expect("static genesis id literal"),
            target: TARGET.parse().expect("static target literal"),
            block_reward: BLOCK_REWARD,
        }
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::mainnet()
    }
}
