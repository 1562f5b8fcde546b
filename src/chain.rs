//! Capabilities the engine consumes from its host chain.

use crate::{error::AtmosError, header::Header, params};
use alloy_primitives::{Address, B256, U256};
use std::{collections::BTreeMap, sync::Arc};

/// Read-only access to the header chain.
pub trait ChainReader: Send + Sync {
    /// The chain configuration the headers are verified against.
    fn config(&self) -> &ChainConfig;

    /// The current head header, if the chain is non-empty.
    fn current_header(&self) -> Option<Header>;

    /// Header by hash and number.
    fn get_header(&self, hash: B256, number: u64) -> Option<Header>;

    /// Canonical header by number.
    fn get_header_by_number(&self, number: u64) -> Option<Header>;

    /// Header by hash.
    fn get_header_by_hash(&self, hash: B256) -> Option<Header>;
}

/// Chain-level configuration consulted during header verification and
/// finalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    /// Network identifier.
    pub network_id: u64,

    /// Block from which EIP-158 state clearing applies.
    pub eip158_block: Option<u64>,

    /// Canonical hashes pinned at hard-fork blocks. A header at one of
    /// these numbers must hash to the pinned value.
    pub fork_hashes: BTreeMap<u64, B256>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            network_id: params::NETWORK_ID,
            eip158_block: Some(0),
            fork_hashes: BTreeMap::new(),
        }
    }
}

impl ChainConfig {
    /// Whether EIP-158 rules are active at the given block number.
    pub fn is_eip158(&self, number: u64) -> bool {
        self.eip158_block.is_some_and(|block| block <= number)
    }

    /// The canonical hash pinned for a hard fork at `number`, if any.
    pub fn fork_hash(&self, number: u64) -> Option<B256> {
        self.fork_hashes.get(&number).copied()
    }
}

/// Mutable state access used while finalising a block.
pub trait StateDb {
    /// Credit `amount` wei to `address`.
    fn add_balance(&mut self, address: Address, amount: U256);

    /// Compute the intermediate state root.
    fn intermediate_root(&mut self, is_eip158: bool) -> B256;
}

/// Callback producing a 65 byte secp256k1 signature over `payload` on behalf
/// of the signing account, tagged with the given mime type.
pub type SignerFn =
    Arc<dyn Fn(Address, &str, &[u8]) -> Result<[u8; 65], AtmosError> + Send + Sync>;
