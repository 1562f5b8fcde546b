//! Cross-chain governance client: resolves the reference-chain endpoint,
//! fetches the composer list from the governance contract and reduces it to
//! the working signer set for an epoch.

use crate::{config::AtmosConfig, error::AtmosError, params, NUMBER_OF_SIGNERS};
use alloy_primitives::{hex, keccak256, Address, U256};
use std::time::Duration;
use tracing::info;

/// Solidity signature of the governance view returning the composer list.
const GET_COMPOSERS_SIGNATURE: &str = "getComposers(uint256,uint256)";

/// Composers are sampled this many seconds in the past so reference-chain
/// reorgs cannot flip the result between verifiers.
pub const ETHEREUM_SYNC_TIMEOUT_SECS: u64 = 20 * 60;

/// HTTP timeout for governance calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Capability producing the raw composer list for a given block and
/// reference timestamp.
pub trait GovernanceClient: Send + Sync {
    fn get_composers(
        &self,
        block_number: u64,
        reference_timestamp: u64,
    ) -> Result<Vec<Address>, AtmosError>;
}

/// The effective reference-chain RPC endpoint for `config`.
pub fn resolve_endpoint(config: &AtmosConfig) -> &str {
    if !config.ethereum_api_endpoint.is_empty() {
        return &config.ethereum_api_endpoint;
    }
    if config.enable_testnet {
        params::TESTNET_ETHEREUM_RPC_PROVIDER
    } else {
        params::ETHEREUM_RPC_PROVIDER
    }
}

/// The effective governance contract address for `config`. The configured
/// address is only honoured alongside an explicit endpoint.
pub fn resolve_governance_address(config: &AtmosConfig) -> Address {
    if !config.ethereum_api_endpoint.is_empty() {
        return config.governance_address;
    }
    if config.enable_testnet {
        params::TESTNET_GOVERNANCE_ADDRESS
    } else {
        params::GOVERNANCE_ADDRESS
    }
}

/// Reference timestamp for the composer query at `number`, shifted into the
/// past by the sync window.
pub fn composers_check_timestamp(number: u64, parent_time: u64) -> u64 {
    if number == 0 {
        0
    } else {
        parent_time.saturating_sub(ETHEREUM_SYNC_TIMEOUT_SECS)
    }
}

/// Deterministically reduce the composer list to the working signer set for
/// the epoch containing `number`.
///
/// At most [`NUMBER_OF_SIGNERS`] addresses are taken; the start index shifts
/// by one per epoch so the working set rotates through the full list without
/// reordering it.
pub fn probabilistic_selection(addresses: &[Address], number: u64, epoch: u64) -> Vec<Address> {
    let actual = addresses.len().min(NUMBER_OF_SIGNERS);
    if actual == 0 {
        return Vec::new();
    }
    let start = ((number / epoch) % actual as u64) as usize;
    info!(
        actual_signers = actual,
        shift = start,
        "selecting new signers"
    );

    (0..actual)
        .map(|index| addresses[(start + index) % addresses.len()])
        .collect()
}

/// ABI call data for `getComposers(blockNumber, referenceTimestamp)`.
pub fn encode_get_composers(block_number: u64, reference_timestamp: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 64);
    data.extend_from_slice(&keccak256(GET_COMPOSERS_SIGNATURE.as_bytes())[..4]);
    data.extend_from_slice(&U256::from(block_number).to_be_bytes::<32>());
    data.extend_from_slice(&U256::from(reference_timestamp).to_be_bytes::<32>());
    data
}

/// Decode an ABI-encoded return whose first value is a dynamic `address[]`.
/// Trailing return values are ignored.
pub fn decode_address_array(data: &[u8]) -> Result<Vec<Address>, AtmosError> {
    fn word(data: &[u8], offset: usize) -> Result<&[u8], AtmosError> {
        offset
            .checked_add(32)
            .and_then(|end| data.get(offset..end))
            .ok_or_else(|| AtmosError::Governance {
                message: "truncated ABI response".into(),
            })
    }

    let head = U256::from_be_slice(word(data, 0)?);
    let array_offset =
        usize::try_from(head).map_err(|_| AtmosError::Governance {
            message: "address array offset out of range".into(),
        })?;

    let len = U256::from_be_slice(word(data, array_offset)?);
    let len = usize::try_from(len).map_err(|_| AtmosError::Governance {
        message: "address array length out of range".into(),
    })?;
    if len > data.len() / 32 {
        return Err(AtmosError::Governance {
            message: "address array length exceeds payload".into(),
        });
    }

    let mut addresses = Vec::with_capacity(len);
    for index in 0..len {
        let slot = word(data, array_offset + 32 * (index + 1))?;
        addresses.push(Address::from_slice(&slot[12..]));
    }
    Ok(addresses)
}

/// Governance client talking JSON-RPC to the configured reference chain.
pub struct HttpGovernanceClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    contract: Address,
}

impl HttpGovernanceClient {
    /// Build a client for the endpoint and contract `config` resolves to.
    pub fn from_config(config: &AtmosConfig) -> Result<Self, AtmosError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .map_err(|e| AtmosError::Governance {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            endpoint: resolve_endpoint(config).to_string(),
            contract: resolve_governance_address(config),
        })
    }

    /// The resolved RPC endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The resolved governance contract address.
    pub fn contract(&self) -> Address {
        self.contract
    }
}

impl GovernanceClient for HttpGovernanceClient {
    fn get_composers(
        &self,
        block_number: u64,
        reference_timestamp: u64,
    ) -> Result<Vec<Address>, AtmosError> {
        let data = encode_get_composers(block_number, reference_timestamp);
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [
                {
                    "to": self.contract.to_string(),
                    "data": format!("0x{}", hex::encode(&data)),
                },
                "latest",
            ],
        });

        let response: serde_json::Value = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| AtmosError::Governance {
                message: e.to_string(),
            })?
            .json()
            .map_err(|e| AtmosError::Governance {
                message: e.to_string(),
            })?;

        if let Some(error) = response.get("error") {
            return Err(AtmosError::Governance {
                message: error.to_string(),
            });
        }
        let result = response
            .get("result")
            .and_then(|value| value.as_str())
            .ok_or_else(|| AtmosError::Governance {
                message: "eth_call response missing result".into(),
            })?;
        let raw = hex::decode(result).map_err(|e| AtmosError::Governance {
            message: e.to_string(),
        })?;

        decode_address_array(&raw)
    }
}
