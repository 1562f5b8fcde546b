//! ATMOS consensus errors.

use alloy_primitives::{Address, B256};
use thiserror::Error;

/// Errors surfaced by the ATMOS consensus engine.
///
/// None of these are retried internally; the chain consumer decides whether
/// to reject the block, pause sync, or abort mining.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AtmosError {
    /// Seal requested or queried on the genesis block.
    #[error("unknown block")]
    UnknownBlock,

    /// Block timestamp is ahead of the local clock.
    #[error("block from future: block time {block_time}, current time {current_time}")]
    FutureBlock {
        block_time: u64,
        current_time: u64,
    },

    /// Parent is neither in the chain nor in the supplied parents batch.
    #[error("unknown ancestor")]
    UnknownAncestor,

    /// Checkpoint block has a non-zero beneficiary.
    #[error("beneficiary in checkpoint block non-zero")]
    InvalidCheckpointBeneficiary,

    /// Extra-data shorter than the 32 byte vanity prefix.
    #[error("extra-data 32 byte vanity prefix missing")]
    MissingVanity,

    /// Extra-data shorter than vanity plus the 65 byte seal suffix.
    #[error("extra-data 65 byte signature suffix missing")]
    MissingSignature,

    /// Non-checkpoint block carries signer bytes.
    #[error("non-checkpoint block contains extra signer list")]
    ExtraSigners,

    /// Checkpoint signer segment is not a multiple of 20 bytes.
    #[error("invalid signer list on checkpoint block")]
    InvalidCheckpointSigners,

    /// Checkpoint signer list diverges from the locally computed snapshot.
    #[error("mismatching signer list on checkpoint block")]
    MismatchingCheckpointSigners,

    /// Non-zero mix digest.
    #[error("non-zero mix digest")]
    InvalidMixDigest,

    /// Non-empty uncle hash.
    #[error("non empty uncle hash")]
    InvalidUncleHash,

    /// Difficulty is neither 1 nor 2.
    #[error("invalid difficulty: {difficulty}")]
    InvalidDifficulty { difficulty: u64 },

    /// Difficulty does not match the turn of the signer.
    #[error(
        "wrong difficulty: signer {signer} at block {block}, expected {expected}, got {actual}"
    )]
    WrongDifficulty {
        signer: Address,
        block: u64,
        expected: u64,
        actual: u64,
    },

    /// Timestamp closer to the parent than the configured period allows.
    #[error("invalid timestamp: parent {parent_time} + period {period} > block {block_time}")]
    InvalidTimestamp {
        parent_time: u64,
        period: u64,
        block_time: u64,
    },

    /// Snapshot application attempted over a non-contiguous header batch.
    #[error("invalid header chain")]
    InvalidHeaderChain,

    /// Recovered signer is not in the authorised set.
    #[error("unauthorized signer: {signer}")]
    UnauthorizedSigner { signer: Address },

    /// Signer produced a block within the recent-signer window.
    #[error("signer {signer} recently signed at block {recent_block}")]
    RecentlySigned { signer: Address, recent_block: u64 },

    /// Governance contract returned no composers at an epoch boundary.
    #[error("invalid number of signers")]
    InvalidNumberOfSigners,

    /// Header hash diverges from the canonical hash pinned for a hard fork.
    #[error("fork hash mismatch at block {number}: expected {expected}, got {actual}")]
    ForkHashMismatch {
        number: u64,
        expected: B256,
        actual: B256,
    },

    /// The 65 byte seal could not be recovered to a public key.
    #[error("signature recovery failed: {message}")]
    SignatureRecoveryFailed { message: String },

    /// The signing backend refused or failed to produce a seal.
    #[error("signing failed: {message}")]
    SigningFailed { message: String },

    /// Governance RPC transport or ABI decoding failure.
    #[error("governance call failed: {message}")]
    Governance { message: String },

    /// Snapshot persistence failure.
    #[error("database error: {message}")]
    Database { message: String },
}
