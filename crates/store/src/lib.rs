//! dcop store: in-RAM object store for DeploymentConfigs and Deployments.
//!
//! Behaves like the API server where the reconciler can tell the difference:
//! uids and resource versions are stamped on write, stale resource versions
//! and duplicate creates are conflicts. It also plays the two roles that are
//! external in a real cluster: the runtime that reports available replicas
//! and the garbage collector that follows owner references.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dcop_core::{
    DeploymentConfig, DeploymentConfigStatus, ObjectKey, ObjectStore, StoreError, StoreOp, StoreResult,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::Resource;
use rustc_hash::FxHashMap;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    desired: FxHashMap<ObjectKey, DeploymentConfig>,
    managed: FxHashMap<ObjectKey, Deployment>,
    last_rv: u64,
    writes: FxHashMap<StoreOp, u64>,
    faults: FxHashMap<StoreOp, VecDeque<StoreError>>,
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.last_rv = self.last_rv.saturating_add(1);
        self.last_rv.to_string()
    }

    fn stamp_new(&mut self, meta: &mut ObjectMeta) {
        meta.uid = Some(Uuid::new_v4().to_string());
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        meta.resource_version = Some(self.next_rv());
    }

    fn take_fault(&mut self, op: StoreOp) -> StoreResult<()> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(op = op.as_str(), error = %err, "injected store fault");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn count_write(&mut self, op: StoreOp) {
        *self.writes.entry(op).or_insert(0) += 1;
    }
}

fn check_rv(meta: &ObjectMeta, expected: Option<&str>, what: &str) -> StoreResult<()> {
    match expected {
        Some(rv) if meta.resource_version.as_deref() != Some(rv) => Err(StoreError::Conflict(format!(
            "{} has been modified (rv {} -> {})",
            what,
            rv,
            meta.resource_version.as_deref().unwrap_or("-")
        ))),
        _ => Ok(()),
    }
}

/// Mirrors the `minimum: 0` schema rule the API server enforces on replica counts.
fn check_replicas(replicas: Option<i32>, what: &str) -> StoreResult<()> {
    match replicas {
        Some(n) if n < 0 => Err(StoreError::Invalid(format!("{}: replicas must be >= 0, got {}", what, n))),
        _ => Ok(()),
    }
}

fn key_of<K: Resource>(obj: &K) -> StoreResult<ObjectKey> {
    ObjectKey::from_resource(obj).map_err(|field| StoreError::Invalid(format!("object missing {}", field)))
}

/// In-memory [`ObjectStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or update a DeploymentConfig the way a user would.
    /// Updates replace the spec and keep uid and status.
    pub fn apply_desired(&self, mut dc: DeploymentConfig) -> StoreResult<DeploymentConfig> {
        let key = key_of(&dc)?;
        check_replicas(Some(dc.spec.replicas), "deploymentconfig")?;
        let mut inner = self.lock();
        let rv = inner.next_rv();
        match inner.desired.get_mut(&key) {
            Some(existing) => {
                existing.spec = dc.spec;
                existing.metadata.resource_version = Some(rv);
                Ok(existing.clone())
            }
            None => {
                inner.stamp_new(&mut dc.metadata);
                inner.desired.insert(key, dc.clone());
                Ok(dc)
            }
        }
    }

    /// Remove a DeploymentConfig. Owned Deployments stay until [`collect_garbage`](Self::collect_garbage).
    pub fn delete_desired(&self, key: &ObjectKey) -> bool {
        self.lock().desired.remove(key).is_some()
    }

    /// Seed a Deployment directly, bypassing the controller write counters.
    pub fn insert_managed(&self, mut dep: Deployment) -> StoreResult<Deployment> {
        let key = key_of(&dep)?;
        let mut inner = self.lock();
        inner.stamp_new(&mut dep.metadata);
        inner.managed.insert(key, dep.clone());
        Ok(dep)
    }

    pub fn desired(&self, key: &ObjectKey) -> Option<DeploymentConfig> {
        self.lock().desired.get(key).cloned()
    }

    pub fn managed(&self, key: &ObjectKey) -> Option<Deployment> {
        self.lock().managed.get(key).cloned()
    }

    /// Identities of all DeploymentConfigs, sorted.
    pub fn desired_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.lock().desired.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn managed_len(&self) -> usize {
        self.lock().managed.len()
    }

    /// Report `available` ready replicas for a Deployment, as the runtime would.
    pub fn set_available_replicas(&self, key: &ObjectKey, available: i32) -> StoreResult<()> {
        let mut inner = self.lock();
        let rv = inner.next_rv();
        let dep = inner
            .managed
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("deployment {}", key)))?;
        let status = dep.status.get_or_insert_with(DeploymentStatus::default);
        status.available_replicas = Some(available);
        dep.metadata.resource_version = Some(rv);
        Ok(())
    }

    /// Bring every Deployment's available replicas up to its spec. Returns how many changed.
    pub fn settle_all(&self) -> usize {
        let targets: Vec<(ObjectKey, i32)> = {
            let inner = self.lock();
            inner
                .managed
                .iter()
                .filter_map(|(k, d)| {
                    let want = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
                    let have = d.status.as_ref().and_then(|s| s.available_replicas).unwrap_or(0);
                    (want != have).then(|| (k.clone(), want))
                })
                .collect()
        };
        let mut changed = 0;
        for (k, want) in targets {
            if self.set_available_replicas(&k, want).is_ok() {
                changed += 1;
            }
        }
        changed
    }

    /// Delete Deployments whose controlling DeploymentConfig no longer exists.
    /// Deployments without a controller reference are left alone.
    pub fn collect_garbage(&self) -> Vec<ObjectKey> {
        let mut inner = self.lock();
        let live: Vec<String> = inner.desired.values().filter_map(|dc| dc.metadata.uid.clone()).collect();
        let kind = DeploymentConfig::kind(&());
        let orphans: Vec<ObjectKey> = inner
            .managed
            .iter()
            .filter(|(_, dep)| {
                dep.metadata
                    .owner_references
                    .as_ref()
                    .and_then(|refs| refs.iter().find(|o| o.controller == Some(true)))
                    .map(|o| o.kind == kind && !live.contains(&o.uid))
                    .unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for k in &orphans {
            inner.managed.remove(k);
            info!(ns = %k.namespace, name = %k.name, "garbage collected orphaned deployment");
        }
        orphans
    }

    /// Fail the next call of `op` with `err`. Faults queue up per operation.
    pub fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    /// Total successful controller writes.
    pub fn write_count(&self) -> u64 {
        self.lock().writes.values().sum()
    }

    pub fn writes_for(&self, op: StoreOp) -> u64 {
        self.lock().writes.get(&op).copied().unwrap_or(0)
    }

    pub fn reset_writes(&self) {
        self.lock().writes.clear();
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get_desired(&self, key: &ObjectKey) -> StoreResult<Option<DeploymentConfig>> {
        let mut inner = self.lock();
        inner.take_fault(StoreOp::GetDesired)?;
        Ok(inner.desired.get(key).cloned())
    }

    async fn get_managed(&self, key: &ObjectKey) -> StoreResult<Option<Deployment>> {
        let mut inner = self.lock();
        inner.take_fault(StoreOp::GetManaged)?;
        Ok(inner.managed.get(key).cloned())
    }

    async fn create_managed(&self, deployment: &Deployment) -> StoreResult<()> {
        let key = key_of(deployment)?;
        let mut inner = self.lock();
        inner.take_fault(StoreOp::CreateManaged)?;
        check_replicas(deployment.spec.as_ref().and_then(|s| s.replicas), "deployment")?;
        if inner.managed.contains_key(&key) {
            return Err(StoreError::Conflict(format!("deployment {} already exists", key)));
        }
        let mut dep = deployment.clone();
        dep.status = None;
        inner.stamp_new(&mut dep.metadata);
        inner.managed.insert(key, dep);
        inner.count_write(StoreOp::CreateManaged);
        Ok(())
    }

    async fn patch_managed_replicas(
        &self,
        key: &ObjectKey,
        replicas: i32,
        resource_version: Option<&str>,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.take_fault(StoreOp::PatchManagedReplicas)?;
        check_replicas(Some(replicas), "deployment")?;
        let rv = inner.next_rv();
        let dep = inner
            .managed
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("deployment {}", key)))?;
        check_rv(&dep.metadata, resource_version, "deployment")?;
        dep.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        dep.metadata.resource_version = Some(rv);
        inner.count_write(StoreOp::PatchManagedReplicas);
        Ok(())
    }

    async fn patch_desired_status(
        &self,
        key: &ObjectKey,
        status: &DeploymentConfigStatus,
        resource_version: Option<&str>,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.take_fault(StoreOp::PatchDesiredStatus)?;
        let rv = inner.next_rv();
        let dc = inner
            .desired
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("deploymentconfig {}", key)))?;
        check_rv(&dc.metadata, resource_version, "deploymentconfig")?;
        dc.status = Some(*status);
        dc.metadata.resource_version = Some(rv);
        inner.count_write(StoreOp::PatchDesiredStatus);
        Ok(())
    }
}
