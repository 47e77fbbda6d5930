//! Registration of a deployment generation's targets.

use crate::eviction::{Evictor, RunState};
use crate::gateway::{self, SharedGateway};
use crate::manager::{Error, OnboardRequest};
use crate::policy::Policy;
use crate::registry::{Registry, Resolution};
use crate::store::SharedStore;
use crate::upstream::{NewTarget, RemoteTimestamp, Upstream};

use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::sleep;
use tracing::{event, Level};

/// Registers a generation's targets against an upstream and hands the
/// previous generation over to the evictor.
pub(crate) struct Onboarder {
    gateway: SharedGateway,
    store: SharedStore,
    policy: Policy,
    registry: Registry,
    evictor: Arc<Evictor>,
}

impl Onboarder {
    pub(crate) fn new(
        gateway: SharedGateway,
        store: SharedStore,
        policy: Policy,
        evictor: Arc<Evictor>,
    ) -> Self {
        let registry = Registry::new(gateway.clone(), store.clone());
        Self {
            gateway,
            store,
            policy,
            registry,
            evictor,
        }
    }

    /// Registers every target in the request, then schedules eviction or
    /// cleanup for the previous generation as policy dictates.
    ///
    /// A failing target add aborts the call; targets already added in this
    /// batch are not rolled back remotely (pool growth is additive and the
    /// caller is expected to retry), but the error always propagates.
    /// Anything scheduled here is fire-and-forget and never blocks the
    /// reply.
    pub(crate) async fn onboard(&self, request: &OnboardRequest) -> Result<(), Error> {
        let resolution = self
            .registry
            .resolve_or_create(&request.key, &request.healthcheck_path, request.deployment)
            .await?;
        let upstream = resolution.upstream().clone();
        let previous = match resolution {
            Resolution::Created(_) => {
                // Give the control plane time to converge the new object
                // before targets are registered against it.
                sleep(self.policy.create_grace).await;
                None
            }
            Resolution::Existing(previous) => Some(previous),
        };

        let fresh_cutoff = self.register_targets(&upstream, request).await?;

        let Some(previous) = previous else {
            return Ok(());
        };
        if !self.policy.active_eviction {
            return Ok(());
        }

        if request.deployment != previous.last_deployment {
            // Fire-and-forget; the run owns its own termination.
            let _ = self.evictor.spawn_run(RunState {
                upstream: upstream.id,
                deployment: request.deployment,
                fresh_cutoff,
                retries_left: self.policy.retry_budget(),
            });
        } else if self.quiet_for(&previous) > self.policy.unexpected_redeploy_threshold {
            event!(
                Level::INFO,
                upstream = %request.key,
                deployment = %request.deployment,
                "same generation re-onboarded after a quiet period, cleaning unhealthy targets"
            );
            let evictor = self.evictor.clone();
            let upstream_id = upstream.id;
            tokio::task::spawn(async move {
                if let Err(err) = evictor.clean_unhealthy(upstream_id, fresh_cutoff).await {
                    event!(
                        Level::ERROR,
                        err = ?err,
                        upstream = %upstream_id,
                        "unexpected-redeploy cleanup failed"
                    );
                }
            });
        }
        Ok(())
    }

    /// Adds each address to the remote upstream and persists its row.
    ///
    /// Returns the freshness cutoff for this batch: the remote creation
    /// time of the last target added.
    async fn register_targets(
        &self,
        upstream: &Upstream,
        request: &OnboardRequest,
    ) -> Result<RemoteTimestamp, Error> {
        let mut fresh_cutoff = RemoteTimestamp::default();
        for address in &request.targets {
            let remote = self.gateway.add_target(&upstream.remote_id, address).await?;
            if remote.created_at == RemoteTimestamp::default() {
                return Err(gateway::Error::Rejected(format!(
                    "add-target response for {address} carried no creation time"
                ))
                .into());
            }
            fresh_cutoff = remote.created_at;
            self.store
                .insert_target(NewTarget {
                    upstream: upstream.id,
                    remote_id: remote.id,
                    address: address.clone(),
                    deployment: request.deployment,
                    created_at: remote.created_at,
                })
                .await?;
            event!(
                Level::INFO,
                upstream = %request.key,
                target = %address,
                deployment = %request.deployment,
                "registered target"
            );
        }
        Ok(fresh_cutoff)
    }

    fn quiet_for(&self, previous: &Upstream) -> tokio::time::Duration {
        // Clock trouble reads as "no quiet time", which biases away from
        // deleting.
        SystemTime::now()
            .duration_since(previous.updated_at)
            .unwrap_or_default()
    }
}
