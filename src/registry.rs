//! Get-or-create resolution of upstream pools.

use crate::gateway::{self, SharedGateway};
use crate::manager::Error;
use crate::store::SharedStore;
use crate::upstream::{DeploymentId, NewUpstream, Upstream, UpstreamKey};

use tracing::{event, Level};

/// The outcome of resolving a key to an upstream pool.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// The pool already existed. Holds the row as it was before this call
    /// recorded the new deployment, so callers can see the previous
    /// generation and update time.
    Existing(Upstream),

    /// The remote upstream object was created by this call.
    Created(Upstream),
}

impl Resolution {
    pub(crate) fn upstream(&self) -> &Upstream {
        match self {
            Resolution::Existing(upstream) | Resolution::Created(upstream) => upstream,
        }
    }
}

/// Resolves a logical pool key to exactly one remote upstream object,
/// creating it at most once under concurrent callers.
#[derive(Clone)]
pub(crate) struct Registry {
    gateway: SharedGateway,
    store: SharedStore,
}

impl Registry {
    pub(crate) fn new(gateway: SharedGateway, store: SharedStore) -> Self {
        Self { gateway, store }
    }

    /// Returns the upstream row for `key`, creating the remote object and
    /// the row if neither exists yet, and records `deployment` as the
    /// latest generation on the existing path.
    ///
    /// The slow path takes the store's per-key row lock and re-checks
    /// existence under it, which closes the race where two callers both
    /// miss the initial read. Remote creation failure rolls the
    /// transaction back; no partial row is persisted.
    pub(crate) async fn resolve_or_create(
        &self,
        key: &UpstreamKey,
        healthcheck_path: &str,
        deployment: DeploymentId,
    ) -> Result<Resolution, Error> {
        if let Some(existing) = self.store.upstream(key).await? {
            self.store
                .record_deployment(existing.id, deployment)
                .await?;
            return Ok(Resolution::Existing(existing));
        }

        let mut tx = self.store.begin(key).await?;

        let found = match tx.upstream_for_update().await {
            Ok(found) => found,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err.into());
            }
        };
        if let Some(existing) = found {
            // Lost the race: another caller created the row while we were
            // waiting on the lock.
            event!(Level::DEBUG, upstream = %key, "found row under lock");
            tx.commit().await?;
            self.store
                .record_deployment(existing.id, deployment)
                .await?;
            return Ok(Resolution::Existing(existing));
        }

        let remote = match self.gateway.create_upstream(&key.name, healthcheck_path).await {
            Ok(remote) => remote,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err.into());
            }
        };
        if remote.id.is_empty() {
            let _ = tx.rollback().await;
            return Err(gateway::Error::Rejected(format!(
                "create response for {key} carried no upstream id"
            ))
            .into());
        }

        let upstream = match tx
            .insert_upstream(NewUpstream {
                key: key.clone(),
                remote_id: remote.id,
                healthcheck_path: healthcheck_path.to_string(),
                config: remote.config,
                last_deployment: deployment,
            })
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                let _ = tx.rollback().await;
                return Err(err.into());
            }
        };
        tx.commit().await?;

        event!(
            Level::INFO,
            upstream = %key,
            remote_id = %upstream.remote_id,
            "created remote upstream"
        );
        Ok(Resolution::Created(upstream))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::Store;
    use crate::stores::memory::MemoryStore;
    use crate::test_utils::FakeGateway;
    use futures::future::join_all;
    use std::sync::Arc;

    fn key() -> UpstreamKey {
        UpstreamKey::new("org", "proj", "prod", "az-1", "svc")
    }

    #[tokio::test]
    async fn concurrent_resolves_create_remote_object_once() {
        crate::test_utils::setup_tracing_subscriber();
        let gateway = Arc::new(FakeGateway::new());
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(gateway.clone(), store.clone());

        let calls = (0..8).map(|_| {
            let registry = registry.clone();
            async move {
                registry
                    .resolve_or_create(&key(), "/health", DeploymentId(1))
                    .await
                    .unwrap()
            }
        });
        let resolutions = join_all(calls).await;

        assert_eq!(gateway.create_calls(), 1);

        let created = resolutions
            .iter()
            .filter(|r| matches!(r, Resolution::Created(_)))
            .count();
        assert_eq!(created, 1);

        let remote_id = resolutions[0].upstream().remote_id.clone();
        for resolution in &resolutions {
            assert_eq!(resolution.upstream().remote_id, remote_id);
        }
    }

    #[tokio::test]
    async fn existing_path_returns_previous_row_and_records_new_generation() {
        let gateway = Arc::new(FakeGateway::new());
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(gateway.clone(), store.clone());

        let first = registry
            .resolve_or_create(&key(), "/health", DeploymentId(1))
            .await
            .unwrap();
        assert!(matches!(first, Resolution::Created(_)));

        let second = registry
            .resolve_or_create(&key(), "/health", DeploymentId(2))
            .await
            .unwrap();
        let Resolution::Existing(previous) = second else {
            panic!("second resolve should see the existing row");
        };

        // The returned row predates this call's bookkeeping; the store has
        // already moved on.
        assert_eq!(previous.last_deployment, DeploymentId(1));
        let current = store.upstream(&key()).await.unwrap().unwrap();
        assert_eq!(current.last_deployment, DeploymentId(2));
        assert_eq!(gateway.create_calls(), 1);
    }

    #[tokio::test]
    async fn remote_create_failure_persists_nothing() {
        let gateway = Arc::new(FakeGateway::new());
        gateway.fail_create();
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new(gateway.clone(), store.clone());

        registry
            .resolve_or_create(&key(), "/health", DeploymentId(1))
            .await
            .expect_err("create failure should surface");
        assert!(store.upstream(&key()).await.unwrap().is_none());

        // The row lock must have been released by the rollback.
        gateway.succeed_create();
        registry
            .resolve_or_create(&key(), "/health", DeploymentId(1))
            .await
            .expect("retry should succeed once the gateway recovers");
    }
}
