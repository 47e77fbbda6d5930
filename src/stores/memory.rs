//! An in-memory store with per-key row locking.
//!
//! Everything lives in process memory and is lost on restart, which makes
//! this store suitable for tests and single-process embedders that keep
//! their durable source of truth elsewhere.

use crate::store::{Error, Store, Transaction};
use crate::upstream::{
    DeploymentId, NewTarget, NewUpstream, Target, TargetAddress, TargetId, Upstream, UpstreamId,
    UpstreamKey,
};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};

#[derive(Default)]
struct Tables {
    upstreams: BTreeMap<UpstreamId, Upstream>,
    targets: BTreeMap<TargetId, Target>,
    next_upstream_id: u64,
    next_target_id: u64,
}

impl Tables {
    fn upstream_by_key(&self, key: &UpstreamKey) -> Option<Upstream> {
        self.upstreams.values().find(|u| &u.key == key).cloned()
    }
}

/// A [Store] backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,

    // One async mutex per composite key, handed out as an owned guard to
    // the open transaction. This is the row lock of the get-or-create
    // path.
    row_locks: Arc<Mutex<HashMap<UpstreamKey, Arc<RowMutex<()>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn row_lock(&self, key: &UpstreamKey) -> Arc<RowMutex<()>> {
        let mut locks = self.row_locks.lock().unwrap();
        locks.entry(key.clone()).or_default().clone()
    }

    #[cfg(test)]
    pub(crate) fn backdate_upstream(&self, id: UpstreamId, updated_at: SystemTime) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(row) = tables.upstreams.get_mut(&id) {
            row.updated_at = updated_at;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upstream(&self, key: &UpstreamKey) -> Result<Option<Upstream>, Error> {
        Ok(self.tables.lock().unwrap().upstream_by_key(key))
    }

    async fn upstream_by_id(&self, id: UpstreamId) -> Result<Option<Upstream>, Error> {
        Ok(self.tables.lock().unwrap().upstreams.get(&id).cloned())
    }

    async fn begin(&self, key: &UpstreamKey) -> Result<Box<dyn Transaction>, Error> {
        let row_lock = self.row_lock(key).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            tables: self.tables.clone(),
            key: key.clone(),
            staged: None,
            _row_lock: row_lock,
        }))
    }

    async fn record_deployment(
        &self,
        id: UpstreamId,
        deployment: DeploymentId,
    ) -> Result<(), Error> {
        let mut tables = self.tables.lock().unwrap();
        let row = tables
            .upstreams
            .get_mut(&id)
            .ok_or_else(|| Error::Other(anyhow::anyhow!("no upstream row with id {}", id)))?;
        row.last_deployment = deployment;
        row.updated_at = SystemTime::now();
        Ok(())
    }

    async fn insert_target(&self, target: NewTarget) -> Result<Target, Error> {
        let mut tables = self.tables.lock().unwrap();
        tables.next_target_id += 1;
        let row = Target {
            id: TargetId(tables.next_target_id),
            upstream: target.upstream,
            remote_id: target.remote_id,
            address: target.address,
            deployment: target.deployment,
            created_at: target.created_at,
        };
        tables.targets.insert(row.id, row.clone());
        Ok(row)
    }

    async fn delete_target(&self, id: TargetId) -> Result<(), Error> {
        self.tables.lock().unwrap().targets.remove(&id);
        Ok(())
    }

    async fn targets_by_address(
        &self,
        upstream: UpstreamId,
        address: &TargetAddress,
    ) -> Result<Vec<Target>, Error> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .targets
            .values()
            .filter(|t| t.upstream == upstream && &t.address == address)
            .cloned()
            .collect())
    }

    async fn targets_by_deployment(&self, deployment: DeploymentId) -> Result<Vec<Target>, Error> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .targets
            .values()
            .filter(|t| t.deployment == deployment)
            .cloned()
            .collect())
    }
}

struct MemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    key: UpstreamKey,
    staged: Option<Upstream>,
    _row_lock: OwnedMutexGuard<()>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn upstream_for_update(&mut self) -> Result<Option<Upstream>, Error> {
        Ok(self.tables.lock().unwrap().upstream_by_key(&self.key))
    }

    async fn insert_upstream(&mut self, upstream: NewUpstream) -> Result<Upstream, Error> {
        let mut tables = self.tables.lock().unwrap();
        tables.next_upstream_id += 1;
        let row = Upstream {
            id: UpstreamId(tables.next_upstream_id),
            key: upstream.key,
            remote_id: upstream.remote_id,
            healthcheck_path: upstream.healthcheck_path,
            config: upstream.config,
            last_deployment: upstream.last_deployment,
            updated_at: SystemTime::now(),
        };
        self.staged = Some(row.clone());
        Ok(row)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), Error> {
        if let Some(row) = self.staged.take() {
            self.tables.lock().unwrap().upstreams.insert(row.id, row);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), Error> {
        // Staged rows die with the transaction.
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::upstream::RemoteId;
    use tokio::time::Duration;

    fn key() -> UpstreamKey {
        UpstreamKey::new("org", "proj", "prod", "az-1", "svc")
    }

    fn new_upstream(key: UpstreamKey) -> NewUpstream {
        NewUpstream {
            key,
            remote_id: RemoteId::new("up-1"),
            healthcheck_path: "/health".to_string(),
            config: serde_json::json!({}),
            last_deployment: DeploymentId(1),
        }
    }

    #[tokio::test]
    async fn staged_insert_invisible_until_commit() {
        let store = MemoryStore::new();

        let mut tx = store.begin(&key()).await.unwrap();
        tx.insert_upstream(new_upstream(key())).await.unwrap();
        assert!(store.upstream(&key()).await.unwrap().is_none());

        tx.commit().await.unwrap();
        let row = store.upstream(&key()).await.unwrap().unwrap();
        assert_eq!(row.last_deployment, DeploymentId(1));
    }

    #[tokio::test]
    async fn rollback_discards_staged_insert() {
        let store = MemoryStore::new();

        let mut tx = store.begin(&key()).await.unwrap();
        tx.insert_upstream(new_upstream(key())).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.upstream(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn row_lock_excludes_second_transaction() {
        let store = MemoryStore::new();

        let tx = store.begin(&key()).await.unwrap();

        // A second transaction on the same key must block until the first
        // one resolves.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), store.begin(&key())).await;
        assert!(blocked.is_err());

        tx.rollback().await.unwrap();
        tokio::time::timeout(Duration::from_millis(50), store.begin(&key()))
            .await
            .expect("lock should be free after rollback")
            .unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let store = MemoryStore::new();
        let other = UpstreamKey::new("org", "proj", "prod", "az-2", "svc");

        let _tx = store.begin(&key()).await.unwrap();
        tokio::time::timeout(Duration::from_millis(50), store.begin(&other))
            .await
            .expect("unrelated key should not block")
            .unwrap();
    }

    #[tokio::test]
    async fn record_deployment_bumps_updated_at() {
        let store = MemoryStore::new();
        let mut tx = store.begin(&key()).await.unwrap();
        let row = tx.insert_upstream(new_upstream(key())).await.unwrap();
        tx.commit().await.unwrap();

        let before = SystemTime::now() - Duration::from_secs(3600);
        store.backdate_upstream(row.id, before);

        store
            .record_deployment(row.id, DeploymentId(2))
            .await
            .unwrap();
        let updated = store.upstream_by_id(row.id).await.unwrap().unwrap();
        assert_eq!(updated.last_deployment, DeploymentId(2));
        assert!(updated.updated_at > before);
    }

    #[tokio::test]
    async fn target_queries_filter_by_upstream_address_and_generation() {
        let store = MemoryStore::new();
        let t1 = store
            .insert_target(NewTarget {
                upstream: UpstreamId(1),
                remote_id: RemoteId::new("t-1"),
                address: TargetAddress::from("10.0.0.1:80"),
                deployment: DeploymentId(1),
                created_at: crate::upstream::RemoteTimestamp(100),
            })
            .await
            .unwrap();
        store
            .insert_target(NewTarget {
                upstream: UpstreamId(2),
                remote_id: RemoteId::new("t-2"),
                address: TargetAddress::from("10.0.0.1:80"),
                deployment: DeploymentId(2),
                created_at: crate::upstream::RemoteTimestamp(200),
            })
            .await
            .unwrap();

        let by_addr = store
            .targets_by_address(UpstreamId(1), &TargetAddress::from("10.0.0.1:80"))
            .await
            .unwrap();
        assert_eq!(by_addr.len(), 1);
        assert_eq!(by_addr[0].id, t1.id);

        let by_gen = store.targets_by_deployment(DeploymentId(2)).await.unwrap();
        assert_eq!(by_gen.len(), 1);
        assert_eq!(by_gen[0].upstream, UpstreamId(2));

        store.delete_target(t1.id).await.unwrap();
        assert!(store
            .targets_by_address(UpstreamId(1), &TargetAddress::from("10.0.0.1:80"))
            .await
            .unwrap()
            .is_empty());
    }
}
