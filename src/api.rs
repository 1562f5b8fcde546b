//! Read-only `atmos_*` RPC namespace exposing snapshot inspection.

use crate::{
    chain::ChainReader, database::Database, engine::Atmos, error::AtmosError, header::Header,
    snapshot::Snapshot,
};
use alloy_primitives::{Address, B256};
use jsonrpsee::{
    core::RpcResult,
    proc_macros::rpc,
    types::{ErrorObject, ErrorObjectOwned},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};

/// JSON-RPC server error code for consensus lookups.
const SERVER_ERROR: i32 = -32000;

/// Wire representation of an authorisation snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    /// Block number the snapshot describes.
    pub number: u64,
    /// Block hash at `number`.
    pub hash: B256,
    /// Authorised signers in ascending order.
    pub signers: Vec<Address>,
    /// Recent signers by block number.
    pub recents: BTreeMap<u64, Address>,
}

impl From<Snapshot> for SnapshotInfo {
    fn from(snap: Snapshot) -> Self {
        Self {
            number: snap.number,
            hash: snap.hash,
            signers: snap.signers_list(),
            recents: snap.recents,
        }
    }
}

/// The `atmos_*` RPC namespace.
#[rpc(server, namespace = "atmos")]
pub trait AtmosApi {
    /// The authorisation snapshot at the given block number, or at the
    /// chain head when no number is given.
    #[method(name = "getSnapshot")]
    async fn get_snapshot(&self, number: Option<u64>) -> RpcResult<SnapshotInfo>;

    /// The authorisation snapshot at the given block hash.
    #[method(name = "getSnapshotAtHash")]
    async fn get_snapshot_at_hash(&self, hash: B256) -> RpcResult<SnapshotInfo>;

    /// The authorised signers at the given block number, or at the chain
    /// head when no number is given.
    #[method(name = "getSigners")]
    async fn get_signers(&self, number: Option<u64>) -> RpcResult<Vec<Address>>;

    /// The authorised signers at the given block hash.
    #[method(name = "getSignersAtHash")]
    async fn get_signers_at_hash(&self, hash: B256) -> RpcResult<Vec<Address>>;
}

fn unknown_block() -> ErrorObjectOwned {
    ErrorObject::owned(SERVER_ERROR, AtmosError::UnknownBlock.to_string(), None::<()>)
}

fn consensus_error(error: AtmosError) -> ErrorObjectOwned {
    ErrorObject::owned(SERVER_ERROR, error.to_string(), None::<()>)
}

/// Implementation of the `atmos_*` namespace over an engine and its chain.
pub struct AtmosRpc<DB, C> {
    engine: Arc<Atmos<DB>>,
    chain: Arc<C>,
}

impl<DB: Database, C: ChainReader> AtmosRpc<DB, C> {
    pub fn new(engine: Arc<Atmos<DB>>, chain: Arc<C>) -> Self {
        Self { engine, chain }
    }

    fn header_by_number(&self, number: Option<u64>) -> Result<Header, ErrorObjectOwned> {
        match number {
            None => self.chain.current_header(),
            Some(number) => self.chain.get_header_by_number(number),
        }
        .ok_or_else(unknown_block)
    }

    fn snapshot_after(&self, header: &Header) -> Result<Snapshot, ErrorObjectOwned> {
        self.engine
            .snapshot(self.chain.as_ref(), header.number, header.hash(), &[])
            .map_err(consensus_error)
    }
}

#[async_trait::async_trait]
impl<DB, C> AtmosApiServer for AtmosRpc<DB, C>
where
    DB: Database + 'static,
    C: ChainReader + 'static,
{
    async fn get_snapshot(&self, number: Option<u64>) -> RpcResult<SnapshotInfo> {
        let header = self.header_by_number(number)?;
        Ok(self.snapshot_after(&header)?.into())
    }

    async fn get_snapshot_at_hash(&self, hash: B256) -> RpcResult<SnapshotInfo> {
        let header = self
            .chain
            .get_header_by_hash(hash)
            .ok_or_else(unknown_block)?;
        Ok(self.snapshot_after(&header)?.into())
    }

    async fn get_signers(&self, number: Option<u64>) -> RpcResult<Vec<Address>> {
        let header = self.header_by_number(number)?;
        Ok(self.snapshot_after(&header)?.signers_list())
    }

    async fn get_signers_at_hash(&self, hash: B256) -> RpcResult<Vec<Address>> {
        let header = self
            .chain
            .get_header_by_hash(hash)
            .ok_or_else(unknown_block)?;
        Ok(self.snapshot_after(&header)?.signers_list())
    }
}
