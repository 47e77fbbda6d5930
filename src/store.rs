//! Durable records of known upstreams and their targets.

use crate::upstream::{
    DeploymentId, NewTarget, NewUpstream, Target, TargetAddress, TargetId, Upstream, UpstreamId,
    UpstreamKey,
};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(anyhow::Error),
}

/// Persistence for upstream pools and their targets.
///
/// Implementations must make [Store::begin] provide genuine mutual
/// exclusion per [UpstreamKey]; it is the only locking primitive the
/// get-or-create path relies on.
#[async_trait]
pub trait Store: Send + Sync {
    /// Non-locking read of the upstream row for a key.
    async fn upstream(&self, key: &UpstreamKey) -> Result<Option<Upstream>, Error>;

    async fn upstream_by_id(&self, id: UpstreamId) -> Result<Option<Upstream>, Error>;

    /// Opens a transaction holding an exclusive row lock scoped to `key`.
    ///
    /// The lock is held until the transaction is committed, rolled back,
    /// or dropped. Concurrent calls for the same key serialize here.
    async fn begin(&self, key: &UpstreamKey) -> Result<Box<dyn Transaction>, Error>;

    /// Records `deployment` as the latest generation for an upstream and
    /// bumps its `updated_at` to now.
    async fn record_deployment(
        &self,
        id: UpstreamId,
        deployment: DeploymentId,
    ) -> Result<(), Error>;

    async fn insert_target(&self, target: NewTarget) -> Result<Target, Error>;

    async fn delete_target(&self, id: TargetId) -> Result<(), Error>;

    /// All target rows bound to `upstream` under `address`, across
    /// generations.
    async fn targets_by_address(
        &self,
        upstream: UpstreamId,
        address: &TargetAddress,
    ) -> Result<Vec<Target>, Error>;

    /// All target rows created by one generation.
    async fn targets_by_deployment(&self, deployment: DeploymentId) -> Result<Vec<Target>, Error>;
}

/// A store transaction holding the row lock for one [UpstreamKey].
///
/// Nothing staged through the transaction is visible to plain [Store]
/// reads until [Transaction::commit]; dropping the transaction without
/// committing discards staged writes and releases the lock.
#[async_trait]
pub trait Transaction: Send {
    /// Re-reads the upstream row for the transaction's key, under the
    /// row lock.
    async fn upstream_for_update(&mut self) -> Result<Option<Upstream>, Error>;

    /// Stages a new upstream row, returning it with its assigned id.
    async fn insert_upstream(&mut self, upstream: NewUpstream) -> Result<Upstream, Error>;

    async fn commit(self: Box<Self>) -> Result<(), Error>;

    async fn rollback(self: Box<Self>) -> Result<(), Error>;
}

/// Helper type for anything that implements the store interface.
pub type SharedStore = Arc<dyn Store>;
