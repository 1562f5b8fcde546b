//! ATMOS proof-of-authority consensus engine.
//!
//! ATMOS seals and verifies Ethereum-style headers under a delegated
//! proof-of-authority protocol. Unlike vote-driven PoA schemes, the
//! authorised signer set is sourced from a governance contract living on a
//! separate reference chain and refreshed once per epoch: at every epoch
//! boundary the engine queries the contract for the composer list, reduces
//! it to a working set of at most [`NUMBER_OF_SIGNERS`] addresses, and
//! embeds the resulting list into the checkpoint header.
//!
//! # Components
//!
//! - [`engine::Atmos`]: header verification, sealing with turn-based
//!   delays, snapshot memoisation, reward finalisation.
//! - [`snapshot::Snapshot`]: the signer set and recent-signer history at a
//!   `(number, hash)`, materialised lazily by replaying headers backwards
//!   to a trusted checkpoint.
//! - [`governance`]: the cross-chain governance client and the
//!   deterministic probabilistic signer selection.
//! - [`api::AtmosRpc`]: the read-only `atmos_*` RPC namespace.
//!
//! Chain access, snapshot persistence, state mutation and the signing
//! backend are consumed through the capability traits in [`chain`] and
//! [`database`].

pub mod api;
pub mod chain;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod governance;
pub mod header;
pub mod params;
pub mod snapshot;

pub use api::{AtmosApiServer, AtmosRpc, SnapshotInfo};
pub use chain::{ChainConfig, ChainReader, SignerFn, StateDb};
pub use config::AtmosConfig;
pub use database::{Database, MemoryDatabase};
pub use engine::Atmos;
pub use error::AtmosError;
pub use governance::{GovernanceClient, HttpGovernanceClient};
pub use header::{genesis_extra, Block, Header};
pub use snapshot::Snapshot;

/// Fixed number of extra-data prefix bytes reserved for signer vanity.
pub const EXTRA_VANITY: usize = 32;

/// Fixed number of extra-data suffix bytes reserved for the signer seal.
pub const EXTRA_SEAL: usize = 65;

/// Number of recent snapshots to keep in memory.
pub const INMEMORY_SNAPSHOTS: usize = 128;

/// Number of recent block signatures to keep in memory.
pub const INMEMORY_SIGNATURES: usize = 4096;

/// Block difficulty for in-turn signatures.
pub const DIFF_IN_TURN: u64 = 2;

/// Block difficulty for out-of-turn signatures.
pub const DIFF_NO_TURN: u64 = 1;

/// Random delay per signer, in milliseconds, granted to out-of-turn
/// sealers so concurrent signers can break ties.
pub const WIGGLE_TIME_MS: u64 = 1000;

/// Timestamp gap demanded of a recent signer under the strict
/// recent-signer variant, in seconds.
pub const RECENTS_TIMEOUT_SECS: u64 = 30;

/// Maximum number of working signers selected per epoch.
pub const NUMBER_OF_SIGNERS: usize = 10;

/// Mime type tag handed to the signing backend for header seals.
pub const MIMETYPE_ATMOS: &str = "application/x-atmos-header";
