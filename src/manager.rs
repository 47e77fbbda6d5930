//! The lifecycle manager: composition root and caller-facing operations.

use crate::eviction::Evictor;
use crate::gateway::{self, SharedGateway};
use crate::onboarder::Onboarder;
use crate::policy::Policy;
#[cfg(feature = "probes")]
use crate::probes;
use crate::store::{self, SharedStore};
use crate::upstream::{DeploymentId, TargetAddress, UpstreamId, UpstreamKey};

use std::sync::Arc;
use thiserror::Error;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    /// No upstream pool is recorded for the key.
    #[error("no upstream found for {0}")]
    UpstreamNotFound(UpstreamKey),

    /// An upstream row referenced by id has vanished from the store.
    #[error("upstream row {0} missing from the store")]
    UpstreamRowMissing(UpstreamId),

    #[error("gateway request failed")]
    Gateway(#[from] gateway::Error),

    #[error("store operation failed")]
    Store(#[from] store::Error),

    /// Some offline removals failed; the remaining addresses were still
    /// attempted.
    #[error("failed to take {} target(s) offline", failed.len())]
    OfflineIncomplete { failed: Vec<TargetAddress> },
}

/// One onboarding call: a generation's worth of targets for one pool.
#[derive(Clone, Debug)]
pub struct OnboardRequest {
    pub key: UpstreamKey,
    pub deployment: DeploymentId,

    /// Health-check path used if the remote upstream has to be created.
    pub healthcheck_path: String,
    pub targets: Vec<TargetAddress>,
}

/// A wrapper type indicating that the USDT probes could not be registered.
///
/// In this case, no probes will be available in the process. However,
/// similar to `std::sync::PoisonError`, this contains the manager itself,
/// so applications which don't care about a probe registration failure can
/// still get access to it.
pub struct RegistrationError(Manager);

impl std::fmt::Debug for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationError").finish_non_exhaustive()
    }
}

impl std::fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        "USDT probe registration failed".fmt(f)
    }
}

impl RegistrationError {
    /// Consume the error and get access to the contained manager.
    pub fn into_inner(self) -> Manager {
        self.0
    }
}

/// Maintains upstream pools across deployments.
///
/// All collaborators are injected; the manager holds no global state and
/// any number of managers can coexist in one process.
pub struct Manager {
    store: SharedStore,
    onboarder: Onboarder,
    evictor: Arc<Evictor>,
}

impl Manager {
    /// Creates a new lifecycle manager.
    ///
    /// - gateway: how to talk to the load-balancer control plane.
    /// - store: where pool membership is durably recorded.
    ///
    /// # DTrace probe registration
    ///
    /// This constructor returns a `Result` because it attempts to register
    /// the USDT probes it exposes, a fallible process. That failure is
    /// extremely unlikely in practice, so the `Err` variant allows callers
    /// to access the constructed manager anyway. If the `"probes"` feature
    /// is not enabled, this method is infallible.
    pub fn new(
        gateway: SharedGateway,
        store: SharedStore,
        policy: Policy,
    ) -> Result<Self, RegistrationError> {
        let evictor = Arc::new(Evictor::new(
            gateway.clone(),
            store.clone(),
            policy.clone(),
        ));
        let onboarder = Onboarder::new(gateway, store.clone(), policy, evictor.clone());
        let self_ = Self {
            store,
            onboarder,
            evictor,
        };
        #[cfg(feature = "probes")]
        match usdt::register_probes() {
            Ok(_) => Ok(self_),
            Err(_) => Err(RegistrationError(self_)),
        }
        #[cfg(not(feature = "probes"))]
        Ok(self_)
    }

    /// Registers a deployment generation's targets against the pool named
    /// by the request's key, creating the remote upstream on first use.
    ///
    /// On success every target is registered; retirement of the previous
    /// generation happens in the background and never blocks this call.
    /// On error, targets added earlier in the batch stay registered
    /// remotely; retrying the call is safe because target adds are
    /// idempotent at the gateway.
    #[instrument(skip(self, request), fields(upstream = %request.key, deployment = %request.deployment), name = "Manager::onboard", err)]
    pub async fn onboard(&self, request: OnboardRequest) -> Result<(), Error> {
        #[cfg(feature = "probes")]
        let key = request.key.to_string();
        #[cfg(feature = "probes")]
        probes::onboard__start!(|| (key.as_str(), request.deployment.0));

        let result = self.onboarder.onboard(&request).await;

        #[cfg(feature = "probes")]
        match &result {
            Ok(()) => probes::onboard__done!(|| (key.as_str(), request.deployment.0)),
            Err(err) => {
                let reason = err.to_string();
                probes::onboard__failed!(|| (key.as_str(), request.deployment.0, reason.as_str()));
            }
        }
        result
    }

    /// Unconditionally removes the named targets from the pool.
    ///
    /// This is the operator-initiated path: it bypasses the protection
    /// that normally keeps the current generation's targets alive. Every
    /// address is attempted even after a failure; if any of them failed,
    /// the call reports [Error::OfflineIncomplete].
    #[instrument(skip(self, addresses), fields(upstream = %key), name = "Manager::offline", err)]
    pub async fn offline(
        &self,
        key: &UpstreamKey,
        addresses: &[TargetAddress],
    ) -> Result<(), Error> {
        let upstream = self
            .store
            .upstream(key)
            .await?
            .ok_or_else(|| Error::UpstreamNotFound(key.clone()))?;

        let mut failed = Vec::new();
        for address in addresses {
            let rows = match self.store.targets_by_address(upstream.id, address).await {
                Ok(rows) => rows,
                Err(err) => {
                    event!(Level::ERROR, err = ?err, target = %address, "target row lookup failed");
                    failed.push(address.clone());
                    continue;
                }
            };
            if rows.is_empty() {
                event!(
                    Level::ERROR,
                    upstream = %key,
                    target = %address,
                    "no target rows to take offline"
                );
                failed.push(address.clone());
                continue;
            }
            let mut address_ok = true;
            for row in rows {
                match self.evictor.remove_target(&upstream, &row, true).await {
                    Ok(_) => event!(
                        Level::INFO,
                        upstream = %key,
                        target = %address,
                        "deleted target on offline request"
                    ),
                    Err(err) => {
                        event!(
                            Level::ERROR,
                            err = ?err,
                            target = %address,
                            "failed to delete target"
                        );
                        address_ok = false;
                    }
                }
            }
            if !address_ok {
                failed.push(address.clone());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::OfflineIncomplete { failed })
        }
    }
}
