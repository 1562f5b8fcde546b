//! ATMOS consensus engine configuration.

use crate::params;
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

/// Consensus engine configuration parameters.
///
/// The authorised signer set is not part of the configuration: it is derived
/// from the governance contract on the reference chain and re-read at every
/// epoch boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtmosConfig {
    /// Number of seconds between blocks to enforce.
    pub period: u64,

    /// Epoch length after which the signer set is refreshed and
    /// re-embedded into the checkpoint header.
    pub epoch: u64,

    /// Governance contract address on the reference chain. Only honoured
    /// when an explicit RPC endpoint is configured; otherwise the built-in
    /// per-network address applies.
    pub governance_address: Address,

    /// Reference-chain RPC endpoint. Empty selects the built-in
    /// mainnet/testnet provider depending on [`AtmosConfig::enable_testnet`].
    pub ethereum_api_endpoint: String,

    /// Use testnet defaults for the RPC endpoint and governance address.
    pub enable_testnet: bool,

    /// Enforce a 30 second timestamp gap for recent signers instead of
    /// rejecting them outright. Off by default.
    pub recents_timeout_enabled: bool,
}

impl Default for AtmosConfig {
    fn default() -> Self {
        Self {
            period: params::BLOCK_INTERVAL,
            epoch: params::EPOCH_INTERVAL,
            governance_address: params::GOVERNANCE_ADDRESS,
            ethereum_api_endpoint: String::new(),
            enable_testnet: false,
            recents_timeout_enabled: false,
        }
    }
}
