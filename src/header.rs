//! Block header and block primitives plus the seal-hash codec.
//!
//! The seal hash is the Keccak-256 of the RLP encoding of the header with
//! the trailing 65 signature bytes stripped from the extra-data, so a header
//! hashes identically before and after sealing.

use crate::{error::AtmosError, EXTRA_SEAL, EXTRA_VANITY};
use alloy_primitives::{keccak256, Address, Bloom, Bytes, B256, B64};
use alloy_rlp::RlpEncodable;

/// Ethereum-style block header carrying the fields ATMOS consensus relies
/// upon. The RLP field order matches the canonical header encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable)]
pub struct Header {
    pub parent_hash: B256,
    pub uncle_hash: B256,
    pub coinbase: Address,
    pub root: B256,
    pub tx_hash: B256,
    pub receipt_hash: B256,
    pub bloom: Bloom,
    pub difficulty: u64,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub time: u64,
    pub extra: Bytes,
    pub mix_digest: B256,
    pub nonce: B64,
}

impl Header {
    /// Keccak-256 of the full RLP encoding, seal included.
    pub fn hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// RLP bytes signed for proof-of-authority sealing: the entire header
    /// apart from the 65 byte signature at the end of the extra-data.
    ///
    /// Panics when the extra-data is shorter than the seal. Callers must
    /// have validated the layout first; accepting both forms would let the
    /// same header produce two different hashes.
    pub fn seal_rlp(&self) -> Vec<u8> {
        assert!(
            self.extra.len() >= EXTRA_SEAL,
            "header extra-data shorter than the 65 byte seal"
        );
        let mut unsealed = self.clone();
        unsealed.extra = Bytes::copy_from_slice(&self.extra[..self.extra.len() - EXTRA_SEAL]);
        alloy_rlp::encode(&unsealed)
    }

    /// Hash of the header prior to it being sealed.
    pub fn seal_hash(&self) -> B256 {
        keccak256(self.seal_rlp())
    }

    /// The 65 byte seal signature at the end of the extra-data.
    pub fn signature(&self) -> Result<&[u8], AtmosError> {
        if self.extra.len() < EXTRA_SEAL {
            return Err(AtmosError::MissingSignature);
        }
        Ok(&self.extra[self.extra.len() - EXTRA_SEAL..])
    }

    /// Signer addresses embedded between vanity and seal on checkpoint
    /// blocks.
    pub fn checkpoint_signers(&self) -> Result<Vec<Address>, AtmosError> {
        if self.extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(AtmosError::MissingSignature);
        }
        let signer_bytes = &self.extra[EXTRA_VANITY..self.extra.len() - EXTRA_SEAL];
        if signer_bytes.len() % Address::len_bytes() != 0 {
            return Err(AtmosError::InvalidCheckpointSigners);
        }
        Ok(signer_bytes
            .chunks(Address::len_bytes())
            .map(Address::from_slice)
            .collect())
    }
}

/// Assemble the extra-data for a genesis header: a 32 byte vanity (padded or
/// truncated), the signer list in ascending address order, and a 65 byte
/// zero seal.
pub fn genesis_extra(vanity: &[u8], signers: &[Address]) -> Bytes {
    let mut extra =
        Vec::with_capacity(EXTRA_VANITY + signers.len() * Address::len_bytes() + EXTRA_SEAL);
    extra.extend_from_slice(vanity);
    extra.resize(EXTRA_VANITY, 0);

    let mut sorted = signers.to_vec();
    sorted.sort();
    for signer in &sorted {
        extra.extend_from_slice(signer.as_slice());
    }

    extra.extend_from_slice(&[0u8; EXTRA_SEAL]);
    Bytes::from(extra)
}

/// A block as assembled by the engine: a header plus opaque transaction and
/// receipt payloads. Uncles are meaningless under proof-of-authority and
/// stay empty on every valid block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Bytes>,
    pub receipts: Vec<Bytes>,
    pub uncles: Vec<Header>,
}

impl Block {
    /// Package a header with its transactions and receipts.
    pub fn new(header: Header, transactions: Vec<Bytes>, receipts: Vec<Bytes>) -> Self {
        Self {
            header,
            transactions,
            receipts,
            uncles: Vec::new(),
        }
    }

    /// The same block contents under a sealed header.
    pub fn with_seal(&self, header: Header) -> Self {
        Self {
            header,
            transactions: self.transactions.clone(),
            receipts: self.receipts.clone(),
            uncles: self.uncles.clone(),
        }
    }

    /// Hash of the block's header.
    pub fn hash(&self) -> B256 {
        self.header.hash()
    }
}
