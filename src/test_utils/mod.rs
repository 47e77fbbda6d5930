//! Utilities to help with testing corral

use crate::gateway::{
    Error, GatewayClient, Health, RemoteTarget, RemoteUpstream, TargetObservation,
};
use crate::upstream::{RemoteId, RemoteTimestamp, TargetAddress};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Sets a test-friendly subscriber so `RUST_LOG` works under `cargo test`.
/// Safe to call from any number of tests.
pub(crate) fn setup_tracing_subscriber() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Inner {
    // Remote target state per (upstream remote id, address).
    targets: BTreeMap<(RemoteId, TargetAddress), TargetObservation>,

    // The fake control-plane clock, advanced once per target add so
    // created_at values are strictly ordered.
    clock: i64,

    next_id: u64,
    create_calls: usize,
    add_calls: usize,
    deleted: Vec<String>,

    fail_create: bool,
    fail_health: bool,
    // Adds beyond this many succeed-then-fail.
    fail_add_after: Option<usize>,
}

/// A scripted gateway for tests: health verdicts are set by hand, and
/// individual operations can be made to fail.
#[derive(Default)]
pub(crate) struct FakeGateway {
    inner: Mutex<Inner>,
}

impl FakeGateway {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.inner.lock().unwrap().create_calls
    }

    pub(crate) fn fail_create(&self) {
        self.inner.lock().unwrap().fail_create = true;
    }

    pub(crate) fn succeed_create(&self) {
        self.inner.lock().unwrap().fail_create = false;
    }

    pub(crate) fn fail_health(&self) {
        self.inner.lock().unwrap().fail_health = true;
    }

    /// Makes every add after the first `count` fail.
    pub(crate) fn fail_add_after(&self, count: usize) {
        self.inner.lock().unwrap().fail_add_after = Some(count);
    }

    pub(crate) fn set_health(&self, address: &str, health: Health) {
        let mut inner = self.inner.lock().unwrap();
        for ((_, addr), observation) in inner.targets.iter_mut() {
            if addr.0.as_ref() == address {
                observation.health = health;
            }
        }
    }

    /// The created_at of the most recently added target.
    pub(crate) fn last_created_at(&self) -> RemoteTimestamp {
        RemoteTimestamp(self.inner.lock().unwrap().clock)
    }

    /// Addresses deleted through the gateway, in order.
    pub(crate) fn deleted(&self) -> Vec<String> {
        self.inner.lock().unwrap().deleted.clone()
    }

    /// Drops the remote object for an address without recording a delete,
    /// as if someone removed it out from under us.
    pub(crate) fn forget_target(&self, address: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.targets.retain(|(_, addr), _| addr.0.as_ref() != address);
    }
}

#[async_trait]
impl GatewayClient for FakeGateway {
    async fn create_upstream(
        &self,
        name: &str,
        healthcheck_path: &str,
    ) -> Result<RemoteUpstream, Error> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_create {
            return Err(Error::Unavailable(anyhow::anyhow!(
                "control plane down (scripted)"
            )));
        }
        inner.create_calls += 1;
        inner.next_id += 1;
        let id = RemoteId::new(format!("up-{}", inner.next_id));
        Ok(RemoteUpstream {
            id: id.clone(),
            config: serde_json::json!({
                "id": id.to_string(),
                "name": name,
                "healthchecks": { "active": { "http_path": healthcheck_path } },
            }),
        })
    }

    async fn add_target(
        &self,
        upstream: &RemoteId,
        address: &TargetAddress,
    ) -> Result<RemoteTarget, Error> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(limit) = inner.fail_add_after {
            if inner.add_calls >= limit {
                return Err(Error::Unavailable(anyhow::anyhow!(
                    "add refused (scripted)"
                )));
            }
        }
        inner.add_calls += 1;
        inner.clock += 1;
        inner.next_id += 1;
        let created_at = RemoteTimestamp(inner.clock);
        let id = RemoteId::new(format!("t-{}", inner.next_id));
        // Re-adding an address overwrites the remote object, like a real
        // gateway upsert would.
        inner.targets.insert(
            (upstream.clone(), address.clone()),
            TargetObservation {
                address: address.clone(),
                created_at,
                health: Health::Healthy,
            },
        );
        Ok(RemoteTarget { id, created_at })
    }

    async fn delete_target(
        &self,
        upstream: &RemoteId,
        address: &TargetAddress,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        // Removing an absent target is success, matching the contract.
        inner.targets.remove(&(upstream.clone(), address.clone()));
        inner.deleted.push(address.to_string());
        Ok(())
    }

    async fn upstream_health(
        &self,
        upstream: &RemoteId,
    ) -> Result<Vec<TargetObservation>, Error> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_health {
            return Err(Error::Unavailable(anyhow::anyhow!(
                "status endpoint down (scripted)"
            )));
        }
        let mut observations: Vec<_> = inner
            .targets
            .iter()
            .filter(|((up, _), _)| up == upstream)
            .map(|(_, observation)| observation.clone())
            .collect();
        observations.sort_by_key(|o| o.created_at);
        Ok(observations)
    }
}
