//! Health-driven retirement of superseded target generations.
//!
//! Each eviction run watches one upstream on behalf of one deployment
//! generation. A run is a sequence of ticks: every tick re-reads the
//! upstream row (the supersession guard), fetches live health from the
//! gateway, deletes unhealthy stale targets immediately, and defers
//! healthy stale targets until the new generation is confirmed healthy or
//! the retry budget runs out. Ticks never surface errors to anyone; the
//! failure mode of a run is "targets stay around longer than expected".

use crate::gateway::SharedGateway;
use crate::manager::Error;
use crate::policy::Policy;
#[cfg(feature = "probes")]
use crate::probes;
use crate::store::SharedStore;
use crate::upstream::{DeploymentId, RemoteTimestamp, Target, Upstream, UpstreamId};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{event, instrument, Level};

/// The state one eviction run carries between ticks.
#[derive(Clone, Debug)]
pub(crate) struct RunState {
    pub(crate) upstream: UpstreamId,

    /// The generation this run cleans up on behalf of. The run ends the
    /// moment the upstream row records a different one.
    pub(crate) deployment: DeploymentId,

    /// Remote targets created at or before this instant are candidates
    /// for eviction; anything newer belongs to the generation being
    /// rolled in.
    pub(crate) fresh_cutoff: RemoteTimestamp,

    pub(crate) retries_left: u32,
}

/// The outcome of a single tick.
#[derive(Debug)]
pub(crate) enum Tick {
    /// Terminal; the run must not be rescheduled.
    Done,

    /// Re-poll after the check interval with the carried state.
    Deferred(RunState),
}

/// Retires superseded targets and handles forced removals.
pub(crate) struct Evictor {
    gateway: SharedGateway,
    store: SharedStore,
    policy: Policy,
}

impl Evictor {
    pub(crate) fn new(gateway: SharedGateway, store: SharedStore, policy: Policy) -> Self {
        Self {
            gateway,
            store,
            policy,
        }
    }

    /// Spawns the self-rescheduling run for one generation.
    ///
    /// The first tick happens one check interval after the call; the task
    /// ends when a tick reports [Tick::Done]. A process restart simply
    /// drops the task, which is acceptable: eviction is advisory cleanup,
    /// and the next deployment's run picks up whatever was left behind.
    pub(crate) fn spawn_run(self: &Arc<Self>, state: RunState) -> JoinHandle<()> {
        let evictor = self.clone();
        tokio::task::spawn(async move {
            let mut state = state;
            loop {
                sleep(evictor.policy.check_interval).await;
                match evictor.tick(state).await {
                    Tick::Done => return,
                    Tick::Deferred(next) => state = next,
                }
            }
        })
    }

    /// One eviction tick. Infallible by design: every error inside is
    /// logged, and classification errors bias toward the non-deleting
    /// branch.
    #[instrument(skip(self), name = "Evictor::tick")]
    pub(crate) async fn tick(&self, state: RunState) -> Tick {
        #[cfg(feature = "probes")]
        probes::evict__tick__start!(|| (state.upstream.0, state.deployment.0));

        let tick = self.tick_inner(state).await;

        #[cfg(feature = "probes")]
        match &tick {
            Tick::Done => probes::evict__tick__done!(|| "done"),
            Tick::Deferred(_) => probes::evict__tick__done!(|| "deferred"),
        }
        tick
    }

    async fn tick_inner(&self, state: RunState) -> Tick {
        let final_tick = state.retries_left == 0;

        let upstream = match self.store.upstream_by_id(state.upstream).await {
            Ok(Some(upstream)) => upstream,
            Ok(None) => {
                event!(
                    Level::WARN,
                    upstream = %state.upstream,
                    "upstream row disappeared, ending eviction run"
                );
                return Tick::Done;
            }
            Err(err) => {
                event!(Level::ERROR, err = ?err, "failed to re-read upstream row");
                return Self::defer(state, final_tick);
            }
        };

        // Supersession guard: a newer deployment's onboarding owns cleanup
        // from here on.
        if upstream.last_deployment != state.deployment {
            event!(
                Level::INFO,
                upstream = %upstream.key,
                run_deployment = %state.deployment,
                current_deployment = %upstream.last_deployment,
                "newer deployment arrived, ending eviction run"
            );
            return Tick::Done;
        }

        let observations = match self.gateway.upstream_health(&upstream.remote_id).await {
            Ok(observations) => observations,
            Err(err) => {
                event!(Level::ERROR, err = ?err, upstream = %upstream.key, "health fetch failed");
                return Self::defer(state, final_tick);
            }
        };

        // Is the new generation all healthy? Stays undetermined until a
        // current-generation target is observed.
        let mut fresh_all_healthy: Option<bool> = None;
        let mut candidates: Vec<Target> = Vec::new();

        for observation in &observations {
            if observation.created_at > state.fresh_cutoff {
                // Belongs to the generation being rolled in.
                continue;
            }
            let rows = match self
                .store
                .targets_by_address(upstream.id, &observation.address)
                .await
            {
                Ok(rows) => rows,
                Err(err) => {
                    event!(
                        Level::ERROR,
                        err = ?err,
                        target = %observation.address,
                        "target row lookup failed"
                    );
                    continue;
                }
            };
            if rows.is_empty() {
                event!(
                    Level::WARN,
                    upstream = %upstream.key,
                    target = %observation.address,
                    "no local row for remote target"
                );
                continue;
            }
            for row in rows {
                if row.deployment == state.deployment {
                    // Timestamps are approximate; a current-generation row
                    // can land on the stale side of the cutoff. It only
                    // feeds the health aggregate.
                    if observation.health.is_unhealthy() {
                        fresh_all_healthy = Some(false);
                    } else if fresh_all_healthy.is_none() {
                        fresh_all_healthy = Some(true);
                    }
                } else if observation.health.is_unhealthy() {
                    match self.remove_target(&upstream, &row, false).await {
                        Ok(true) => event!(
                            Level::INFO,
                            upstream = %upstream.key,
                            target = %row.address,
                            stale_deployment = %row.deployment,
                            "deleted unhealthy superseded target"
                        ),
                        Ok(false) => (),
                        Err(err) => event!(
                            Level::ERROR,
                            err = ?err,
                            target = %row.address,
                            "failed to delete unhealthy target"
                        ),
                    }
                } else {
                    candidates.push(row);
                }
            }
        }

        if final_tick || fresh_all_healthy == Some(true) {
            candidates.sort_by_key(|row| row.created_at);
            for row in &candidates {
                match self.remove_target(&upstream, row, false).await {
                    Ok(true) => event!(
                        Level::INFO,
                        upstream = %upstream.key,
                        target = %row.address,
                        stale_deployment = %row.deployment,
                        final_tick,
                        "deleted superseded target"
                    ),
                    Ok(false) => (),
                    Err(err) => event!(
                        Level::ERROR,
                        err = ?err,
                        target = %row.address,
                        "failed to delete superseded target"
                    ),
                }
            }
            return Tick::Done;
        }

        Tick::Deferred(RunState {
            retries_left: state.retries_left - 1,
            ..state
        })
    }

    fn defer(state: RunState, final_tick: bool) -> Tick {
        if final_tick {
            return Tick::Done;
        }
        Tick::Deferred(RunState {
            retries_left: state.retries_left - 1,
            ..state
        })
    }

    /// Single-pass removal of unhealthy stale targets, for the case where
    /// the same generation keeps re-onboarding long after a new one was
    /// expected. No deferred bookkeeping, no retries.
    #[instrument(skip(self), name = "Evictor::clean_unhealthy")]
    pub(crate) async fn clean_unhealthy(
        &self,
        upstream: UpstreamId,
        fresh_cutoff: RemoteTimestamp,
    ) -> Result<(), Error> {
        let upstream = self
            .store
            .upstream_by_id(upstream)
            .await?
            .ok_or(Error::UpstreamRowMissing(upstream))?;
        let observations = self.gateway.upstream_health(&upstream.remote_id).await?;

        for observation in &observations {
            if observation.created_at > fresh_cutoff || !observation.health.is_unhealthy() {
                continue;
            }
            let rows = match self
                .store
                .targets_by_address(upstream.id, &observation.address)
                .await
            {
                Ok(rows) => rows,
                Err(err) => {
                    event!(
                        Level::ERROR,
                        err = ?err,
                        target = %observation.address,
                        "target row lookup failed"
                    );
                    continue;
                }
            };
            if rows.is_empty() {
                event!(
                    Level::WARN,
                    upstream = %upstream.key,
                    target = %observation.address,
                    "no local row for remote target"
                );
                continue;
            }
            for row in rows {
                match self.remove_target(&upstream, &row, false).await {
                    Ok(true) => event!(
                        Level::INFO,
                        upstream = %upstream.key,
                        target = %row.address,
                        "deleted unhealthy target after unexpected redeploy"
                    ),
                    Ok(false) => (),
                    Err(err) => event!(
                        Level::ERROR,
                        err = ?err,
                        target = %row.address,
                        "failed to delete unhealthy target"
                    ),
                }
            }
        }
        Ok(())
    }

    /// Deletes one target from the gateway and the store.
    ///
    /// Unless `force` is set, an address still used by the upstream's
    /// current generation is left alone. Remote deletion of an absent
    /// target counts as success, so this is safe to repeat.
    ///
    /// Returns whether the target was actually deleted.
    pub(crate) async fn remove_target(
        &self,
        upstream: &Upstream,
        row: &Target,
        force: bool,
    ) -> Result<bool, Error> {
        if !force {
            let current = self
                .store
                .upstream_by_id(upstream.id)
                .await?
                .ok_or(Error::UpstreamRowMissing(upstream.id))?;
            let in_use = self
                .store
                .targets_by_deployment(current.last_deployment)
                .await?;
            if in_use.iter().any(|t| t.address == row.address) {
                event!(
                    Level::WARN,
                    upstream = %upstream.key,
                    target = %row.address,
                    "target still used by the current deployment, skipping delete"
                );
                #[cfg(feature = "probes")]
                {
                    let key = upstream.key.to_string();
                    let target = row.address.to_string();
                    probes::target__delete__skipped!(|| (key.as_str(), target.as_str()));
                }
                return Ok(false);
            }
        }

        self.gateway
            .delete_target(&upstream.remote_id, &row.address)
            .await?;
        self.store.delete_target(row.id).await?;
        #[cfg(feature = "probes")]
        {
            let key = upstream.key.to_string();
            let target = row.address.to_string();
            probes::target__deleted!(|| (key.as_str(), target.as_str()));
        }
        Ok(true)
    }
}
