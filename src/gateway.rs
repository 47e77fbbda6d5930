//! The interface to the load-balancer control plane.

use crate::upstream::{RemoteId, RemoteTimestamp, TargetAddress};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The control plane could not be reached.
    #[error("gateway unavailable")]
    Unavailable(#[source] anyhow::Error),

    /// The control plane refused the request, or answered with a response
    /// this crate cannot use.
    #[error("gateway rejected request: {0}")]
    Rejected(String),
}

/// Health of a remote target, as classified by the gateway's own checks.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Serialize)]
pub enum Health {
    Healthy,
    Unhealthy,

    /// The gateway is not health-checking this target (or has no verdict
    /// yet). Treated as non-deletable by the eviction paths.
    Unknown,
}

impl Health {
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Health::Unhealthy)
    }
}

/// A live observation of one remote target.
///
/// Observations are never persisted; they are fetched from the gateway on
/// every eviction tick.
#[derive(Clone, Debug, Serialize)]
pub struct TargetObservation {
    pub address: TargetAddress,

    /// When the gateway created the remote target object, on the gateway's
    /// clock.
    pub created_at: RemoteTimestamp,
    pub health: Health,
}

/// A freshly created remote upstream object.
#[derive(Clone, Debug)]
pub struct RemoteUpstream {
    pub id: RemoteId,

    /// The full configuration the gateway reports for the new object,
    /// stored verbatim on the local row.
    pub config: serde_json::Value,
}

/// A freshly registered remote target.
#[derive(Clone, Debug)]
pub struct RemoteTarget {
    pub id: RemoteId,
    pub created_at: RemoteTimestamp,
}

/// Remote interface to the load-balancer control plane.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Creates a remote upstream object with an active health check on
    /// `healthcheck_path`.
    async fn create_upstream(
        &self,
        name: &str,
        healthcheck_path: &str,
    ) -> Result<RemoteUpstream, Error>;

    /// Registers a backend address against an existing remote upstream.
    ///
    /// Re-adding an address that is already registered must update the
    /// existing remote target rather than duplicate it, so that retried
    /// onboarding calls stay idempotent.
    async fn add_target(
        &self,
        upstream: &RemoteId,
        address: &TargetAddress,
    ) -> Result<RemoteTarget, Error>;

    /// Removes a backend address from a remote upstream.
    ///
    /// Removing an address that does not exist remotely is success, not an
    /// error; the eviction paths rely on deletes being safely repeatable.
    async fn delete_target(&self, upstream: &RemoteId, address: &TargetAddress)
        -> Result<(), Error>;

    /// Reports the gateway's current per-target health for an upstream.
    async fn upstream_health(&self, upstream: &RemoteId)
        -> Result<Vec<TargetObservation>, Error>;
}

/// Helper type for anything that implements the gateway interface.
pub type SharedGateway = Arc<dyn GatewayClient>;
