//! Authorisation snapshot: the signer set and recent-signer history at a
//! specific point of the chain.
//!
//! Snapshots are immutable values; applying headers produces a new snapshot
//! and leaves the original untouched. Ordered collections keep the JSON
//! persistence format stable so serialisation round-trips byte-for-byte.

use crate::{
    config::AtmosConfig,
    database::{snapshot_key, Database},
    error::AtmosError,
    header::Header,
    DIFF_IN_TURN, DIFF_NO_TURN,
};
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The authorisation state at a given `(number, hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Consensus engine configuration, injected after deserialisation.
    #[serde(skip)]
    pub config: AtmosConfig,

    /// Block number the snapshot describes.
    pub number: u64,

    /// Block hash at `number`.
    pub hash: B256,

    /// Currently authorised signers, ascending by address.
    pub signers: BTreeSet<Address>,

    /// Recent signers by block number, for spam protection.
    pub recents: BTreeMap<u64, Address>,
}

impl Snapshot {
    /// Create a snapshot at a checkpoint. The recent-signer history starts
    /// empty, so only use this for checkpoints whose history is trusted.
    pub fn new(config: AtmosConfig, number: u64, hash: B256, signers: Vec<Address>) -> Self {
        Self {
            config,
            number,
            hash,
            signers: signers.into_iter().collect(),
            recents: BTreeMap::new(),
        }
    }

    /// Load a snapshot from the database and rebind it to the engine
    /// configuration.
    pub fn load(config: AtmosConfig, db: &dyn Database, hash: B256) -> Result<Self, AtmosError> {
        let blob = db
            .get(&snapshot_key(hash))?
            .ok_or_else(|| AtmosError::Database {
                message: format!("no snapshot for {hash}"),
            })?;
        let mut snap: Snapshot = serde_json::from_slice(&blob).map_err(|e| AtmosError::Database {
            message: e.to_string(),
        })?;
        snap.config = config;
        Ok(snap)
    }

    /// Persist the snapshot keyed by its block hash.
    pub fn store(&self, db: &dyn Database) -> Result<(), AtmosError> {
        let blob = serde_json::to_vec(self).map_err(|e| AtmosError::Database {
            message: e.to_string(),
        })?;
        db.put(&snapshot_key(self.hash), &blob)
    }

    /// Authorised signers in ascending order.
    pub fn signers_list(&self) -> Vec<Address> {
        self.signers.iter().copied().collect()
    }

    /// Whether `address` is currently authorised.
    pub fn is_signer(&self, address: &Address) -> bool {
        self.signers.contains(address)
    }

    /// Number of authorised signers.
    pub fn signer_count(&self) -> usize {
        self.signers.len()
    }

    /// Recent-signer window: a signer may produce one block per window of
    /// this many consecutive blocks.
    pub fn recent_limit(&self) -> u64 {
        self.signers.len() as u64 / 2 + 1
    }

    /// Whether `signer` is the designated producer at height `number`.
    pub fn inturn(&self, number: u64, signer: Address) -> bool {
        if self.signers.is_empty() {
            return false;
        }
        let offset = (number % self.signers.len() as u64) as usize;
        self.signers.iter().nth(offset) == Some(&signer)
    }

    /// Expected difficulty for `signer` producing at height `number`.
    pub fn calc_difficulty(&self, number: u64, signer: Address) -> u64 {
        if self.inturn(number, signer) {
            DIFF_IN_TURN
        } else {
            DIFF_NO_TURN
        }
    }

    /// Apply an ascending run of headers on top of this snapshot, producing
    /// the snapshot after the last header. The batch is rejected wholesale
    /// on the first invalid header.
    pub fn apply<F>(&self, headers: &[Header], recover_signer: F) -> Result<Self, AtmosError>
    where
        F: Fn(&Header) -> Result<Address, AtmosError>,
    {
        if headers.is_empty() {
            return Ok(self.clone());
        }

        // The run must be contiguous and start right after this snapshot.
        for pair in headers.windows(2) {
            if pair[1].number != pair[0].number + 1 {
                return Err(AtmosError::InvalidHeaderChain);
            }
        }
        if headers[0].number != self.number + 1 {
            return Err(AtmosError::InvalidHeaderChain);
        }

        let mut snap = self.clone();

        for header in headers {
            let number = header.number;

            // Shift stale signers out of the recent window.
            let limit = snap.recent_limit();
            snap.recents.retain(|&seen, _| seen + limit > number);

            let signer = recover_signer(header)?;
            if !snap.signers.contains(&signer) {
                return Err(AtmosError::UnauthorizedSigner { signer });
            }
            if let Some((&seen, _)) = snap.recents.iter().find(|(_, recent)| **recent == signer) {
                return Err(AtmosError::RecentlySigned {
                    signer,
                    recent_block: seen,
                });
            }
            snap.recents.insert(number, signer);

            let expected = snap.calc_difficulty(number, signer);
            if header.difficulty != expected {
                return Err(AtmosError::WrongDifficulty {
                    signer,
                    block: number,
                    expected,
                    actual: header.difficulty,
                });
            }

            // Epoch transition: adopt the signer list embedded in the
            // checkpoint header and start a fresh recent window.
            if number % snap.config.epoch == 0 {
                snap.signers = header.checkpoint_signers()?.into_iter().collect();
                snap.recents.clear();
            }

            snap.number = number;
            snap.hash = header.hash();
        }

        Ok(snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::MemoryDatabase,
        header::genesis_extra,
        EXTRA_SEAL, EXTRA_VANITY,
    };
    use alloy_primitives::Bytes;
    use std::collections::HashMap;

    fn test_config() -> AtmosConfig {
        AtmosConfig {
            period: 3,
            epoch: 100,
            ..Default::default()
        }
    }

    fn three_signers() -> Vec<Address> {
        vec![
            Address::repeat_byte(0x01),
            Address::repeat_byte(0x02),
            Address::repeat_byte(0x03),
        ]
    }

    /// Builds headers whose signers are resolved through a side table
    /// keyed by header hash, so tests control recovery without real
    /// signatures.
    struct ChainBuilder {
        signers_by_hash: HashMap<B256, Address>,
        headers: Vec<Header>,
    }

    impl ChainBuilder {
        fn new() -> Self {
            Self {
                signers_by_hash: HashMap::new(),
                headers: Vec::new(),
            }
        }

        fn push(&mut self, number: u64, signer: Address, difficulty: u64) -> &mut Self {
            self.push_with_extra(
                number,
                signer,
                difficulty,
                Bytes::from(vec![0u8; EXTRA_VANITY + EXTRA_SEAL]),
            )
        }

        fn push_with_extra(
            &mut self,
            number: u64,
            signer: Address,
            difficulty: u64,
            extra: Bytes,
        ) -> &mut Self {
            let mut extra = extra.to_vec();
            // Make every header hash unique regardless of contents.
            extra[0] = number as u8;
            extra[1] = signer[0];
            let header = Header {
                number,
                difficulty,
                extra: extra.into(),
                ..Default::default()
            };
            self.signers_by_hash.insert(header.hash(), signer);
            self.headers.push(header);
            self
        }

        fn recover(&self) -> impl Fn(&Header) -> Result<Address, AtmosError> + '_ {
            |header: &Header| Ok(self.signers_by_hash[&header.hash()])
        }
    }

    #[test]
    fn inturn_rotates_over_sorted_signers() {
        let signers = three_signers();
        let snap = Snapshot::new(test_config(), 0, B256::ZERO, signers.clone());

        assert!(snap.inturn(0, signers[0]));
        assert!(!snap.inturn(0, signers[1]));
        assert!(snap.inturn(1, signers[1]));
        assert!(snap.inturn(2, signers[2]));
        // Wraps around.
        assert!(snap.inturn(3, signers[0]));
        // Strangers are never in turn.
        assert!(!snap.inturn(0, Address::repeat_byte(0x99)));
    }

    #[test]
    fn single_signer_is_always_in_turn() {
        let only = Address::repeat_byte(0x07);
        let snap = Snapshot::new(test_config(), 0, B256::ZERO, vec![only]);
        for number in 0..5 {
            assert!(snap.inturn(number, only));
            assert_eq!(snap.calc_difficulty(number, only), DIFF_IN_TURN);
        }
        assert_eq!(snap.recent_limit(), 1);
    }

    #[test]
    fn apply_advances_through_in_turn_signers() {
        let signers = three_signers();
        let snap = Snapshot::new(test_config(), 0, B256::ZERO, signers.clone());

        let mut chain = ChainBuilder::new();
        chain
            .push(1, signers[1], DIFF_IN_TURN)
            .push(2, signers[2], DIFF_IN_TURN)
            .push(3, signers[0], DIFF_IN_TURN);

        let applied = snap.apply(&chain.headers, chain.recover()).unwrap();
        assert_eq!(applied.number, 3);
        assert_eq!(applied.hash, chain.headers[2].hash());
        assert_eq!(applied.signers, snap.signers);
        // Window of limit 2: only blocks 2 and 3 remain recent.
        assert_eq!(
            applied.recents,
            BTreeMap::from([(2, signers[2]), (3, signers[0])])
        );
        // The original snapshot is untouched.
        assert_eq!(snap.number, 0);
        assert!(snap.recents.is_empty());
    }

    #[test]
    fn apply_rejects_unauthorized_signer() {
        let signers = three_signers();
        let snap = Snapshot::new(test_config(), 0, B256::ZERO, signers);
        let outsider = Address::repeat_byte(0x99);

        let mut chain = ChainBuilder::new();
        chain.push(1, outsider, DIFF_NO_TURN);

        assert_eq!(
            snap.apply(&chain.headers, chain.recover()),
            Err(AtmosError::UnauthorizedSigner { signer: outsider })
        );
    }

    #[test]
    fn apply_rejects_recently_signed() {
        // S2: with three signers the window is two blocks, so a signer of
        // block 10 is barred at 11 and free again at 12.
        let signers = three_signers();
        let snap = Snapshot::new(test_config(), 9, B256::ZERO, signers.clone());

        let mut blocked = ChainBuilder::new();
        blocked
            .push(10, signers[1], DIFF_IN_TURN)
            .push(11, signers[1], DIFF_NO_TURN);
        assert_eq!(
            snap.apply(&blocked.headers, blocked.recover()),
            Err(AtmosError::RecentlySigned {
                signer: signers[1],
                recent_block: 10,
            })
        );

        let mut free = ChainBuilder::new();
        free.push(10, signers[1], DIFF_IN_TURN)
            .push(11, signers[2], DIFF_IN_TURN)
            .push(12, signers[1], DIFF_NO_TURN);
        let applied = snap.apply(&free.headers, free.recover()).unwrap();
        assert_eq!(applied.number, 12);
    }

    #[test]
    fn apply_rejects_wrong_difficulty() {
        let signers = three_signers();
        let snap = Snapshot::new(test_config(), 5, B256::ZERO, signers.clone());

        // Height 6: 6 mod 3 == 0, so signers[0] is in turn.
        let mut chain = ChainBuilder::new();
        chain.push(6, signers[0], DIFF_NO_TURN);
        assert_eq!(
            snap.apply(&chain.headers, chain.recover()),
            Err(AtmosError::WrongDifficulty {
                signer: signers[0],
                block: 6,
                expected: DIFF_IN_TURN,
                actual: DIFF_NO_TURN,
            })
        );

        let mut out_of_turn = ChainBuilder::new();
        out_of_turn.push(6, signers[1], DIFF_IN_TURN);
        assert_eq!(
            snap.apply(&out_of_turn.headers, out_of_turn.recover()),
            Err(AtmosError::WrongDifficulty {
                signer: signers[1],
                block: 6,
                expected: DIFF_NO_TURN,
                actual: DIFF_IN_TURN,
            })
        );
    }

    #[test]
    fn apply_swaps_signer_set_at_epoch_boundary() {
        let config = AtmosConfig {
            epoch: 4,
            ..test_config()
        };
        let old = three_signers();
        let new = vec![Address::repeat_byte(0x0a), Address::repeat_byte(0x0b)];
        let snap = Snapshot::new(config, 2, B256::ZERO, old.clone());

        let mut chain = ChainBuilder::new();
        chain.push(3, old[0], DIFF_IN_TURN).push_with_extra(
            4,
            old[1],
            DIFF_IN_TURN,
            genesis_extra(&[], &new),
        );

        let applied = snap.apply(&chain.headers, chain.recover()).unwrap();
        assert_eq!(applied.signers_list(), new);
        assert!(applied.recents.is_empty());
        assert_eq!(applied.number, 4);
    }

    #[test]
    fn apply_rejects_non_contiguous_batches() {
        let signers = three_signers();
        let snap = Snapshot::new(test_config(), 0, B256::ZERO, signers.clone());

        let mut gap = ChainBuilder::new();
        gap.push(1, signers[1], DIFF_IN_TURN)
            .push(3, signers[0], DIFF_IN_TURN);
        assert_eq!(
            snap.apply(&gap.headers, gap.recover()),
            Err(AtmosError::InvalidHeaderChain)
        );

        let mut offset = ChainBuilder::new();
        offset.push(5, signers[2], DIFF_IN_TURN);
        assert_eq!(
            snap.apply(&offset.headers, offset.recover()),
            Err(AtmosError::InvalidHeaderChain)
        );
    }

    #[test]
    fn apply_is_deterministic() {
        let signers = three_signers();
        let snap = Snapshot::new(test_config(), 0, B256::ZERO, signers.clone());

        let mut chain = ChainBuilder::new();
        chain
            .push(1, signers[1], DIFF_IN_TURN)
            .push(2, signers[2], DIFF_IN_TURN);

        let first = snap.apply(&chain.headers, chain.recover()).unwrap();
        let second = snap.apply(&chain.headers, chain.recover()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_batch_is_identity() {
        let snap = Snapshot::new(test_config(), 7, B256::repeat_byte(0x77), three_signers());
        let applied = snap.apply(&[], |_| unreachable!()).unwrap();
        assert_eq!(applied, snap);
    }

    #[test]
    fn persistence_round_trips_byte_for_byte() {
        let mut snap = Snapshot::new(
            test_config(),
            200,
            B256::repeat_byte(0xaa),
            three_signers(),
        );
        snap.recents.insert(199, Address::repeat_byte(0x02));
        snap.recents.insert(200, Address::repeat_byte(0x03));

        let encoded = serde_json::to_vec(&snap).unwrap();
        let decoded: Snapshot = serde_json::from_slice(&encoded).unwrap();
        let reencoded = serde_json::to_vec(&decoded).unwrap();
        assert_eq!(encoded, reencoded);

        let db = MemoryDatabase::new();
        snap.store(&db).unwrap();
        let loaded = Snapshot::load(test_config(), &db, snap.hash).unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn load_missing_snapshot_fails() {
        let db = MemoryDatabase::new();
        assert!(Snapshot::load(test_config(), &db, B256::ZERO).is_err());
    }
}
