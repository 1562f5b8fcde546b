//! Network parameter defaults for the ATMOS consensus engine.
//!
//! These mirror the values baked into the Aerum genesis: the governance
//! contract locations on the reference chain, the public RPC providers used
//! when no explicit endpoint is configured, and the chain-wide block
//! parameters.

use alloy_primitives::{address, Address, U256};

/// Governance contract address on the Ethereum mainnet reference chain.
pub const GOVERNANCE_ADDRESS: Address = address!("7f07f6627e9bf1fc821360e0c20f32af532df106");

/// Governance contract address on the testnet reference chain.
pub const TESTNET_GOVERNANCE_ADDRESS: Address =
    address!("02c362540efc9fa5592621c9212d0bf776732050");

/// Default mainnet reference-chain RPC provider.
pub const ETHEREUM_RPC_PROVIDER: &str = "https://mainnet.infura.io";

/// Default testnet reference-chain RPC provider.
pub const TESTNET_ETHEREUM_RPC_PROVIDER: &str = "https://rinkeby.infura.io";

/// Target number of seconds between two consecutive blocks.
pub const BLOCK_INTERVAL: u64 = 3;

/// Number of blocks per epoch; the signer set is refreshed at every
/// multiple of this interval.
pub const EPOCH_INTERVAL: u64 = 100;

/// Network identifier of the ATMOS chain.
pub const NETWORK_ID: u64 = 538;

/// Block gas limit fixed at genesis.
pub const BLOCK_GAS_LIMIT: u64 = 126_000_000;

/// Number of headers a chain may pile up during reconstruction before an
/// epoch checkpoint is considered immutable and trusted as-is.
pub const IMMUTABILITY_THRESHOLD: usize = 90_000;

/// Reward in wei credited to the signer of every sealed block.
pub fn block_reward() -> U256 {
    U256::from(888u128 * 10u128.pow(18))
}
