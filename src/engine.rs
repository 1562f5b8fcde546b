//! The ATMOS proof-of-authority consensus engine.
//!
//! Header verification, snapshot memoisation, block preparation, sealing
//! with turn-based timing delays, and reward finalisation. The authorised
//! signer set is sourced from the cross-chain governance contract at every
//! epoch boundary.

use crate::{
    chain::{ChainReader, SignerFn, StateDb},
    config::AtmosConfig,
    database::Database,
    error::AtmosError,
    governance::{composers_check_timestamp, probabilistic_selection, GovernanceClient},
    header::{Block, Header},
    params, snapshot::Snapshot,
    DIFF_IN_TURN, DIFF_NO_TURN, EXTRA_SEAL, EXTRA_VANITY, INMEMORY_SIGNATURES,
    INMEMORY_SNAPSHOTS, MIMETYPE_ATMOS, RECENTS_TIMEOUT_SECS, WIGGLE_TIME_MS,
};
use alloy_consensus::constants::EMPTY_OMMER_ROOT_HASH;
use alloy_primitives::{keccak256, Address, Bytes, B256, B64};
use crossbeam_channel::{after, bounded, never, select, Receiver, Sender};
use lru::LruCache;
use parking_lot::RwLock;
use rand::Rng;
use secp256k1::{ecdsa::RecoverableSignature, Message, Secp256k1};
use std::{
    num::NonZeroUsize,
    sync::Arc,
    thread,
    time::{Duration, SystemTime},
};
use tracing::{error, info, trace, warn};

/// Seconds since the Unix epoch.
fn now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// The parent of `header`, taken from the tail of the supplied batch when
/// one is given, otherwise from the chain. Mismatching ancestry yields
/// `None`.
fn parent_of<C: ChainReader>(chain: &C, header: &Header, parents: &[Header]) -> Option<Header> {
    let parent = if let Some(last) = parents.last() {
        last.clone()
    } else {
        chain.get_header(header.parent_hash, header.number.checked_sub(1)?)?
    };
    (parent.number + 1 == header.number && parent.hash() == header.parent_hash).then_some(parent)
}

/// Header lookup by number, preferring the supplied batch over the chain.
fn header_by_number<C: ChainReader>(
    chain: &C,
    parents: &[Header],
    number: u64,
) -> Option<Header> {
    parents
        .iter()
        .find(|header| header.number == number)
        .cloned()
        .or_else(|| chain.get_header_by_number(number))
}

/// The ATMOS consensus engine.
pub struct Atmos<DB> {
    /// Consensus engine configuration parameters.
    config: AtmosConfig,

    /// Database to store and retrieve snapshot checkpoints.
    db: Arc<DB>,

    /// Governance contract client supplying the composer list.
    governance: Arc<dyn GovernanceClient>,

    /// Snapshots for recent blocks to speed up reorgs.
    recents: RwLock<LruCache<B256, Snapshot>>,

    /// Signatures of recent blocks to speed up verification.
    signatures: RwLock<LruCache<B256, Address>>,

    /// Signing credentials injected through [`Atmos::authorize`].
    credentials: RwLock<Option<(Address, SignerFn)>>,

    /// Secp256k1 context for signature recovery.
    secp: Secp256k1<secp256k1::All>,

    /// Skip difficulty verification (testing only).
    fake_diff: bool,
}

impl<DB: Database> Atmos<DB> {
    /// Create a new ATMOS engine. A zero epoch falls back to the network
    /// default.
    pub fn new(
        config: AtmosConfig,
        db: Arc<DB>,
        governance: Arc<dyn GovernanceClient>,
    ) -> Self {
        let mut config = config;
        if config.epoch == 0 {
            config.epoch = params::EPOCH_INTERVAL;
        }
        Self {
            config,
            db,
            governance,
            recents: RwLock::new(LruCache::new(
                NonZeroUsize::new(INMEMORY_SNAPSHOTS).unwrap(),
            )),
            signatures: RwLock::new(LruCache::new(
                NonZeroUsize::new(INMEMORY_SIGNATURES).unwrap(),
            )),
            credentials: RwLock::new(None),
            secp: Secp256k1::new(),
            fake_diff: false,
        }
    }

    /// Engine with difficulty verification disabled, for tests that build
    /// chains without honouring turn order.
    pub fn new_fake_diff(
        config: AtmosConfig,
        db: Arc<DB>,
        governance: Arc<dyn GovernanceClient>,
    ) -> Self {
        let mut engine = Self::new(config, db, governance);
        engine.fake_diff = true;
        engine
    }

    /// The engine configuration.
    pub fn config(&self) -> &AtmosConfig {
        &self.config
    }

    /// Inject the signing credentials used to mint new blocks.
    pub fn authorize(&self, signer: Address, sign_fn: SignerFn) {
        *self.credentials.write() = Some((signer, sign_fn));
    }

    /// The currently authorised local signer, if any.
    pub fn signer(&self) -> Option<Address> {
        self.credentials.read().as_ref().map(|(signer, _)| *signer)
    }

    /// The address that sealed `header`, recovered from the signature in
    /// its extra-data.
    pub fn author(&self, header: &Header) -> Result<Address, AtmosError> {
        self.ecrecover(header)
    }

    /// Hash of a header prior to sealing.
    pub fn seal_hash(&self, header: &Header) -> B256 {
        header.seal_hash()
    }

    /// Shut the engine down. A no-op: the engine owns no background
    /// threads beyond in-flight seal waiters.
    pub fn close(&self) -> Result<(), AtmosError> {
        Ok(())
    }

    /// Extract the signer address from a sealed header, memoised by header
    /// hash.
    pub fn ecrecover(&self, header: &Header) -> Result<Address, AtmosError> {
        let hash = header.hash();
        if let Some(address) = self.signatures.write().get(&hash) {
            return Ok(*address);
        }

        let signature = header.signature()?;
        let address = self.recover_address(&header.seal_hash(), signature)?;

        self.signatures.write().put(hash, address);
        Ok(address)
    }

    fn recover_address(&self, hash: &B256, signature: &[u8]) -> Result<Address, AtmosError> {
        if signature.len() != EXTRA_SEAL {
            return Err(AtmosError::MissingSignature);
        }

        // Accept both the 0/1 and legacy 27/28 recovery id encodings.
        let v = signature[64];
        let recovery_value = if v >= 27 { v - 27 } else { v } as i32;
        let recovery_id = secp256k1::ecdsa::RecoveryId::try_from(recovery_value).map_err(|e| {
            AtmosError::SignatureRecoveryFailed {
                message: format!("invalid recovery id {recovery_value}: {e}"),
            }
        })?;
        let recoverable = RecoverableSignature::from_compact(&signature[..64], recovery_id)
            .map_err(|e| AtmosError::SignatureRecoveryFailed {
                message: e.to_string(),
            })?;
        let message = Message::from_digest_slice(hash.as_slice()).map_err(|e| {
            AtmosError::SignatureRecoveryFailed {
                message: e.to_string(),
            }
        })?;
        let pubkey = self.secp.recover_ecdsa(&message, &recoverable).map_err(|e| {
            AtmosError::SignatureRecoveryFailed {
                message: e.to_string(),
            }
        })?;

        let serialized = pubkey.serialize_uncompressed();
        let digest = keccak256(&serialized[1..]);
        Ok(Address::from_slice(&digest[12..]))
    }

    /// Check whether a header conforms to the consensus rules, seal
    /// included.
    pub fn verify_header<C: ChainReader>(
        &self,
        chain: &C,
        header: &Header,
        _seal: bool,
    ) -> Result<(), AtmosError> {
        self.verify_header_with_parents(chain, header, &[])
    }

    /// Verify a batch of headers concurrently. Results stream in input
    /// order over the returned channel; sending on the abort channel stops
    /// the producer.
    pub fn verify_headers<C>(
        self: &Arc<Self>,
        chain: Arc<C>,
        headers: Vec<Header>,
        _seals: Vec<bool>,
    ) -> (Sender<()>, Receiver<Result<(), AtmosError>>)
    where
        C: ChainReader + 'static,
        DB: 'static,
    {
        let (abort_tx, abort_rx) = bounded::<()>(1);
        let (results_tx, results_rx) = bounded(headers.len());
        let engine = Arc::clone(self);

        thread::spawn(move || {
            let mut abort_rx = abort_rx;
            for index in 0..headers.len() {
                let result = engine.verify_header_with_parents(
                    chain.as_ref(),
                    &headers[index],
                    &headers[..index],
                );
                loop {
                    select! {
                        recv(abort_rx) -> message => {
                            if message.is_ok() {
                                return;
                            }
                            // A dropped abort handle is not an abort.
                            abort_rx = never();
                        }
                        send(results_tx, result.clone()) -> sent => {
                            if sent.is_err() {
                                return;
                            }
                            break;
                        }
                    }
                }
            }
        });

        (abort_tx, results_rx)
    }

    /// Uncles are meaningless under proof-of-authority; any uncle fails
    /// the block.
    pub fn verify_uncles<C: ChainReader>(
        &self,
        _chain: &C,
        block: &Block,
    ) -> Result<(), AtmosError> {
        if block.uncles.is_empty() {
            Ok(())
        } else {
            Err(AtmosError::InvalidUncleHash)
        }
    }

    /// Check that the seal signature satisfies the protocol requirements.
    pub fn verify_seal<C: ChainReader>(
        &self,
        chain: &C,
        header: &Header,
    ) -> Result<(), AtmosError> {
        if header.number == 0 {
            return Err(AtmosError::UnknownBlock);
        }
        let snap = self.snapshot(chain, header.number - 1, header.parent_hash, &[])?;
        self.verify_seal_against(chain, &snap, header, &[])
    }

    fn verify_header_with_parents<C: ChainReader>(
        &self,
        chain: &C,
        header: &Header,
        parents: &[Header],
    ) -> Result<(), AtmosError> {
        let number = header.number;

        // Don't waste time on blocks from the future.
        let current_time = now();
        if header.time > current_time {
            return Err(AtmosError::FutureBlock {
                block_time: header.time,
                current_time,
            });
        }

        // Checkpoint blocks enforce a zero beneficiary.
        let checkpoint = number % self.config.epoch == 0;
        if checkpoint && header.coinbase != Address::ZERO {
            return Err(AtmosError::InvalidCheckpointBeneficiary);
        }

        // Extra-data holds the vanity, the seal, and on checkpoints the
        // signer list.
        if header.extra.len() < EXTRA_VANITY {
            return Err(AtmosError::MissingVanity);
        }
        if header.extra.len() < EXTRA_VANITY + EXTRA_SEAL {
            return Err(AtmosError::MissingSignature);
        }
        let signer_bytes = header.extra.len() - EXTRA_VANITY - EXTRA_SEAL;
        if !checkpoint && signer_bytes != 0 {
            return Err(AtmosError::ExtraSigners);
        }
        if checkpoint && signer_bytes % Address::len_bytes() != 0 {
            return Err(AtmosError::InvalidCheckpointSigners);
        }

        // No fork protection in the mix digest, no uncles in PoA.
        if header.mix_digest != B256::ZERO {
            return Err(AtmosError::InvalidMixDigest);
        }
        if header.uncle_hash != EMPTY_OMMER_ROOT_HASH {
            return Err(AtmosError::InvalidUncleHash);
        }

        if number > 0 && header.difficulty != DIFF_IN_TURN && header.difficulty != DIFF_NO_TURN {
            return Err(AtmosError::InvalidDifficulty {
                difficulty: header.difficulty,
            });
        }

        // Hard-fork constraints pinned by the chain configuration.
        if let Some(expected) = chain.config().fork_hash(number) {
            let actual = header.hash();
            if actual != expected {
                return Err(AtmosError::ForkHashMismatch {
                    number,
                    expected,
                    actual,
                });
            }
        }

        self.verify_cascading_fields(chain, header, parents)
    }

    fn verify_cascading_fields<C: ChainReader>(
        &self,
        chain: &C,
        header: &Header,
        parents: &[Header],
    ) -> Result<(), AtmosError> {
        // The genesis block is the always valid dead-end.
        let number = header.number;
        if number == 0 {
            return Ok(());
        }

        let parent = parent_of(chain, header, parents).ok_or(AtmosError::UnknownAncestor)?;
        if parent.time + self.config.period > header.time {
            return Err(AtmosError::InvalidTimestamp {
                parent_time: parent.time,
                period: self.config.period,
                block_time: header.time,
            });
        }

        let snap = self.snapshot(chain, number - 1, header.parent_hash, parents)?;

        // Checkpoint headers must embed the snapshot's signer list verbatim.
        if number % self.config.epoch == 0 {
            if snap.signers_list() != header.checkpoint_signers()? {
                return Err(AtmosError::MismatchingCheckpointSigners);
            }
        }

        self.verify_seal_against(chain, &snap, header, parents)
    }

    fn verify_seal_against<C: ChainReader>(
        &self,
        chain: &C,
        snap: &Snapshot,
        header: &Header,
        parents: &[Header],
    ) -> Result<(), AtmosError> {
        let number = header.number;
        if number == 0 {
            return Err(AtmosError::UnknownBlock);
        }

        let signer = self.ecrecover(header)?;
        if !snap.is_signer(&signer) {
            return Err(AtmosError::UnauthorizedSigner { signer });
        }

        let limit = snap.recent_limit();
        for (&seen, &recent) in &snap.recents {
            if recent != signer || seen <= number.saturating_sub(limit) {
                continue;
            }
            if self.config.recents_timeout_enabled {
                // Stricter variant: a recent signer may seal inside the
                // window after a full timeout gap from its parent.
                let parent =
                    parent_of(chain, header, parents).ok_or(AtmosError::UnknownAncestor)?;
                if parent.time + RECENTS_TIMEOUT_SECS > header.time {
                    return Err(AtmosError::InvalidTimestamp {
                        parent_time: parent.time,
                        period: RECENTS_TIMEOUT_SECS,
                        block_time: header.time,
                    });
                }
            } else {
                return Err(AtmosError::RecentlySigned {
                    signer,
                    recent_block: seen,
                });
            }
        }

        if !self.fake_diff {
            let expected = if snap.inturn(number, signer) {
                DIFF_IN_TURN
            } else {
                DIFF_NO_TURN
            };
            if header.difficulty != expected {
                return Err(AtmosError::WrongDifficulty {
                    signer,
                    block: number,
                    expected,
                    actual: header.difficulty,
                });
            }
        }

        Ok(())
    }

    /// Retrieve the authorisation snapshot describing the chain after block
    /// `(number, hash)`.
    pub fn snapshot<C: ChainReader>(
        &self,
        chain: &C,
        number: u64,
        hash: B256,
        parents: &[Header],
    ) -> Result<Snapshot, AtmosError> {
        let mut headers: Vec<Header> = Vec::new();
        let mut number = number;
        let mut hash = hash;
        let mut parents = parents;

        let snap = loop {
            // An in-memory snapshot shortcuts everything.
            if let Some(snap) = self.recents.write().get(&hash) {
                break snap.clone();
            }

            // At the genesis, or at a checkpoint beyond the reorg horizon
            // or without a reachable parent, trust the embedded signer
            // list as-is.
            if number == 0
                || (number % self.config.epoch == 0
                    && (headers.len() > params::IMMUTABILITY_THRESHOLD
                        || chain.get_header_by_number(number - 1).is_none()))
            {
                if let Some(checkpoint) = chain.get_header_by_number(number) {
                    let checkpoint_hash = checkpoint.hash();
                    let signers = checkpoint.checkpoint_signers()?;
                    let snap =
                        Snapshot::new(self.config.clone(), number, checkpoint_hash, signers);
                    snap.store(self.db.as_ref())?;
                    info!(number, hash = %checkpoint_hash, "stored checkpoint snapshot to disk");
                    break snap;
                }
            }

            // Epoch boundary: reuse a persisted snapshot, or derive a fresh
            // one from the governance contract.
            if number % self.config.epoch == 0 {
                if let Ok(snap) = Snapshot::load(self.config.clone(), self.db.as_ref(), hash) {
                    trace!(number, %hash, "loaded snapshot from disk");
                    break snap;
                }

                let timestamp = if number > 0 {
                    let parent = header_by_number(chain, parents, number - 1)
                        .ok_or(AtmosError::UnknownAncestor)?;
                    composers_check_timestamp(number, parent.time)
                } else {
                    composers_check_timestamp(number, 0)
                };

                let composers = match self.governance.get_composers(number, timestamp) {
                    Ok(composers) => composers,
                    Err(e) => {
                        error!(number, %hash, error = %e, "loading snapshot from governance contract failed");
                        return Err(e);
                    }
                };
                if composers.is_empty() {
                    error!(number, %hash, "governance contract returned no composers");
                    return Err(AtmosError::InvalidNumberOfSigners);
                }

                let signers = probabilistic_selection(&composers, number, self.config.epoch);
                info!(number, %hash, signers = ?signers, timestamp, "loaded signers from governance contract");
                break Snapshot::new(self.config.clone(), number, hash, signers);
            }

            // No snapshot here: gather the header and move backward.
            let header = if let Some(last) = parents.last() {
                if last.hash() != hash || last.number != number {
                    return Err(AtmosError::UnknownAncestor);
                }
                parents = &parents[..parents.len() - 1];
                last.clone()
            } else {
                chain
                    .get_header(hash, number)
                    .ok_or(AtmosError::UnknownAncestor)?
            };
            hash = header.parent_hash;
            number -= 1;
            headers.push(header);
        };

        // Replay the gathered headers, oldest first, on top of the found
        // snapshot.
        headers.reverse();
        let snap = if headers.is_empty() {
            snap
        } else {
            snap.apply(&headers, |header| self.ecrecover(header))?
        };

        self.recents.write().put(snap.hash, snap.clone());

        if snap.number % self.config.epoch == 0 && !headers.is_empty() {
            snap.store(self.db.as_ref())?;
            trace!(number = snap.number, hash = %snap.hash, "stored snapshot to disk");
        }

        Ok(snap)
    }

    /// Initialise the consensus fields of a header for sealing on top of
    /// its parent.
    pub fn prepare<C: ChainReader>(&self, chain: &C, header: &mut Header) -> Result<(), AtmosError> {
        let number = header.number;
        if number == 0 {
            return Err(AtmosError::UnknownBlock);
        }

        header.coinbase = Address::ZERO;
        header.nonce = B64::ZERO;

        let snap = self.snapshot(chain, number - 1, header.parent_hash, &[])?;

        let signer = self.signer().unwrap_or_default();
        header.difficulty = snap.calc_difficulty(number, signer);

        // Vanity, checkpoint signer list, zeroed seal placeholder.
        let mut extra = header.extra.to_vec();
        extra.resize(EXTRA_VANITY, 0);
        if number % self.config.epoch == 0 {
            for signer in snap.signers_list() {
                extra.extend_from_slice(signer.as_slice());
            }
        }
        extra.extend_from_slice(&[0u8; EXTRA_SEAL]);
        header.extra = Bytes::from(extra);

        header.mix_digest = B256::ZERO;

        let parent = chain
            .get_header(header.parent_hash, number - 1)
            .ok_or(AtmosError::UnknownAncestor)?;
        header.time = (parent.time + self.config.period).max(now());

        Ok(())
    }

    /// Credit the block reward and commit the final state root and uncle
    /// hash into the header.
    pub fn finalize<C: ChainReader>(
        &self,
        chain: &C,
        header: &mut Header,
        state: &mut dyn StateDb,
        _txs: &[Bytes],
        _uncles: &[Header],
    ) {
        self.accumulate_rewards(state, header);
        header.root = state.intermediate_root(chain.config().is_eip158(header.number));
        header.uncle_hash = EMPTY_OMMER_ROOT_HASH;
    }

    /// Finalise the header and package it with its transactions and
    /// receipts into a block ready for sealing.
    pub fn finalize_and_assemble<C: ChainReader>(
        &self,
        chain: &C,
        mut header: Header,
        state: &mut dyn StateDb,
        txs: Vec<Bytes>,
        uncles: &[Header],
        receipts: Vec<Bytes>,
    ) -> Block {
        self.finalize(chain, &mut header, state, &txs, uncles);
        Block::new(header, txs, receipts)
    }

    /// Credit the fixed block reward to the block's signer. Recovery only
    /// fails while building our own block, where the seal is still zeroed;
    /// the local credentials stand in for it there.
    fn accumulate_rewards(&self, state: &mut dyn StateDb, header: &Header) {
        let signer = self
            .ecrecover(header)
            .unwrap_or_else(|_| self.signer().unwrap_or_default());
        state.add_balance(signer, params::block_reward());
    }

    /// Attempt to seal the block with the local credentials. The sealed
    /// block is delivered asynchronously on `results` once the signer's
    /// slot arrives; `stop` cancels the pending delivery.
    pub fn seal<C: ChainReader>(
        &self,
        chain: &C,
        block: Block,
        results: Sender<Block>,
        stop: Receiver<()>,
    ) -> Result<(), AtmosError> {
        let mut header = block.header.clone();

        // Sealing the genesis block is not supported.
        let number = header.number;
        if number == 0 {
            return Err(AtmosError::UnknownBlock);
        }
        // For 0-period chains, refuse to seal empty blocks: no reward but
        // the sealing loop would spin.
        if self.config.period == 0 && block.transactions.is_empty() {
            info!("sealing paused, waiting for transactions");
            return Ok(());
        }

        // Don't hold the credentials lock for the whole sealing procedure.
        let (signer, sign_fn) = self
            .credentials
            .read()
            .clone()
            .ok_or(AtmosError::UnauthorizedSigner {
                signer: Address::ZERO,
            })?;

        let snap = self.snapshot(chain, number - 1, header.parent_hash, &[])?;
        if !snap.is_signer(&signer) {
            return Err(AtmosError::UnauthorizedSigner { signer });
        }

        // If we are among the recent signers, wait for the next block.
        let limit = snap.recent_limit();
        for (&seen, &recent) in &snap.recents {
            if recent == signer && number >= limit && seen > number - limit {
                info!(%signer, recent_block = seen, "signed recently, must wait for others");
                return Ok(());
            }
        }

        // Sweet, the protocol permits us to sign the block; wait for our
        // slot, plus a random wiggle when out of turn so concurrent
        // signers can break ties.
        let mut delay = Duration::from_secs(header.time.saturating_sub(now()));
        if header.difficulty == DIFF_NO_TURN {
            let wiggle = (snap.signer_count() as u64 / 2 + 1) * WIGGLE_TIME_MS;
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..wiggle));
            trace!(wiggle_ms = wiggle, "out-of-turn signing requested");
        }

        let signature = sign_fn(signer, MIMETYPE_ATMOS, &header.seal_rlp())?;
        let mut extra = header.extra.to_vec();
        let seal_start = extra.len() - EXTRA_SEAL;
        extra[seal_start..].copy_from_slice(&signature);
        header.extra = Bytes::from(extra);

        let seal_hash = header.seal_hash();
        let sealed = block.with_seal(header);
        trace!(delay_ms = delay.as_millis() as u64, "waiting for slot to sign and propagate");

        thread::spawn(move || {
            let timeout = after(delay);
            let mut stop = stop;
            loop {
                select! {
                    recv(stop) -> message => {
                        if message.is_ok() {
                            return;
                        }
                        // The stop handle is gone; delivery can no longer
                        // be cancelled.
                        stop = never();
                    }
                    recv(timeout) -> _ => break,
                }
            }
            if results.try_send(sealed).is_err() {
                warn!(%seal_hash, "sealing result is not read by miner");
            }
        });

        Ok(())
    }

    /// The difficulty a new block on top of `parent` should carry when
    /// sealed by the local signer.
    pub fn calc_difficulty<C: ChainReader>(
        &self,
        chain: &C,
        _time: u64,
        parent: &Header,
    ) -> Result<u64, AtmosError> {
        let snap = self.snapshot(chain, parent.number, parent.hash(), &[])?;
        let signer = self.signer().unwrap_or_default();
        Ok(snap.calc_difficulty(snap.number + 1, signer))
    }
}
