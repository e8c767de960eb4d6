//! dcop reconciler: drives one Deployment towards the replica count declared
//! by its DeploymentConfig and mirrors the Deployment's available replicas
//! back into the DeploymentConfig status.
//!
//! One call of [`Reconciler::reconcile`] reads the full current state and
//! performs at most one write. When to call it again is up to the caller.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use dcop_core::{DeploymentConfig, ObjectKey, ObjectStore, ReconcileOutcome, StoreError, StoreOp};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

mod config;
mod resources;

pub use config::{load_pod_template, parse_pod_template, ReconcilerConfig};
pub use resources::{build_deployment, placeholder_pod_template, spec_replicas, status_for, status_needs_update};

/// Where one DeploymentConfig stood when a reconcile call finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergencePhase {
    /// DeploymentConfig is gone; nothing was done.
    Deleted,
    /// Deployment was missing and has been created.
    Created,
    /// Deployment replicas differed and have been patched.
    Drifted,
    /// Spec matched; status was stale and has been rewritten.
    StatusSynced,
    /// Spec and status both matched; nothing was written.
    Stable,
}

impl ConvergencePhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConvergencePhase::Deleted => "deleted",
            ConvergencePhase::Created => "created",
            ConvergencePhase::Drifted => "drifted",
            ConvergencePhase::StatusSynced => "status_synced",
            ConvergencePhase::Stable => "stable",
        }
    }
}

/// Result of a successful reconcile call, with the phase for logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePass {
    pub phase: ConvergencePhase,
    pub outcome: ReconcileOutcome,
}

impl ReconcilePass {
    const fn new(phase: ConvergencePhase, outcome: ReconcileOutcome) -> Self {
        Self { phase, outcome }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to get DeploymentConfig {key}: {source}")]
    FetchDesired { key: ObjectKey, #[source] source: StoreError },
    #[error("failed to get Deployment {key}: {source}")]
    FetchManaged { key: ObjectKey, #[source] source: StoreError },
    #[error("failed to create Deployment {key}: {source}")]
    CreateManaged { key: ObjectKey, #[source] source: StoreError },
    #[error("failed to patch replicas of Deployment {key}: {source}")]
    PatchManaged { key: ObjectKey, #[source] source: StoreError },
    #[error("failed to update status of DeploymentConfig {key}: {source}")]
    UpdateStatus { key: ObjectKey, #[source] source: StoreError },
    #[error("DeploymentConfig {key} is missing {field}")]
    MissingObjectKey { key: ObjectKey, field: &'static str },
}

impl ReconcileError {
    pub fn key(&self) -> &ObjectKey {
        match self {
            ReconcileError::FetchDesired { key, .. }
            | ReconcileError::FetchManaged { key, .. }
            | ReconcileError::CreateManaged { key, .. }
            | ReconcileError::PatchManaged { key, .. }
            | ReconcileError::UpdateStatus { key, .. }
            | ReconcileError::MissingObjectKey { key, .. } => key,
        }
    }

    /// Underlying store failure, if the error came from the store.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            ReconcileError::FetchDesired { source, .. }
            | ReconcileError::FetchManaged { source, .. }
            | ReconcileError::CreateManaged { source, .. }
            | ReconcileError::PatchManaged { source, .. }
            | ReconcileError::UpdateStatus { source, .. } => Some(source),
            ReconcileError::MissingObjectKey { .. } => None,
        }
    }

    /// Lost a race with a concurrent writer; the next pass will see fresh state.
    pub fn is_conflict(&self) -> bool {
        matches!(self.store_error(), Some(StoreError::Conflict(_)))
    }
}

/// Convergence function for DeploymentConfigs.
///
/// Holds no per-object state, so one instance can serve any number of
/// identities concurrently as long as each identity is reconciled by one
/// caller at a time.
pub struct Reconciler<S> {
    store: Arc<S>,
    config: ReconcilerConfig,
}

impl<S> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), config: self.config.clone() }
    }
}

impl<S: ObjectStore> Reconciler<S> {
    pub fn new(store: Arc<S>, config: ReconcilerConfig) -> Self {
        Self { store, config }
    }

    /// Reconcile the DeploymentConfig at `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconcile_pass(key).await.map(|pass| pass.outcome)
    }

    /// Like [`reconcile`](Self::reconcile), also reporting the phase reached.
    pub async fn reconcile_pass(&self, key: &ObjectKey) -> Result<ReconcilePass, ReconcileError> {
        let t0 = Instant::now();
        let res = self.converge(key).await;
        histogram!("dcop_reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(pass) => {
                counter!("dcop_reconcile_total", 1, "outcome" => pass.phase.as_str());
                debug!(ns = %key.namespace, name = %key.name, phase = pass.phase.as_str(), requeue = pass.outcome.requeue, "reconcile done");
            }
            Err(e) => {
                counter!("dcop_reconcile_total", 1, "outcome" => "error");
                if e.is_conflict() {
                    debug!(ns = %key.namespace, name = %key.name, error = %e, "reconcile lost a write race");
                } else {
                    warn!(ns = %key.namespace, name = %key.name, error = %e, "reconcile failed");
                }
            }
        }
        res
    }

    async fn converge(&self, key: &ObjectKey) -> Result<ReconcilePass, ReconcileError> {
        let dc = match self.store.get_desired(key).await {
            Ok(Some(dc)) => dc,
            Ok(None) => {
                // Deleted after the event was emitted; owned objects are collected by the store.
                debug!(ns = %key.namespace, name = %key.name, "deploymentconfig not found");
                return Ok(ReconcilePass::new(ConvergencePhase::Deleted, ReconcileOutcome::done()));
            }
            Err(source) => return Err(ReconcileError::FetchDesired { key: key.clone(), source }),
        };

        let dep = match self.store.get_managed(key).await {
            Ok(Some(dep)) => dep,
            Ok(None) => return self.create_managed(key, &dc).await,
            Err(source) => return Err(ReconcileError::FetchManaged { key: key.clone(), source }),
        };

        let desired = dc.spec.replicas;
        let current = spec_replicas(&dep);
        if current != Some(desired) {
            info!(ns = %key.namespace, name = %key.name, current = ?current, desired, "scaling deployment");
            self.store
                .patch_managed_replicas(key, desired, dep.metadata.resource_version.as_deref())
                .await
                .map_err(|source| ReconcileError::PatchManaged { key: key.clone(), source })?;
            record_write(StoreOp::PatchManagedReplicas);
            return Ok(ReconcilePass::new(ConvergencePhase::Drifted, ReconcileOutcome::requeue()));
        }

        let candidate = status_for(&dep);
        let phase = if status_needs_update(dc.status.as_ref(), &candidate) {
            info!(ns = %key.namespace, name = %key.name, available = candidate.available_replicas, "updating deploymentconfig status");
            self.store
                .patch_desired_status(key, &candidate, dc.metadata.resource_version.as_deref())
                .await
                .map_err(|source| ReconcileError::UpdateStatus { key: key.clone(), source })?;
            record_write(StoreOp::PatchDesiredStatus);
            ConvergencePhase::StatusSynced
        } else {
            ConvergencePhase::Stable
        };

        info!(ns = %key.namespace, name = %key.name, message = %dc.spec.message, "deploymentconfig converged");
        Ok(ReconcilePass::new(phase, ReconcileOutcome::done()))
    }

    async fn create_managed(&self, key: &ObjectKey, dc: &DeploymentConfig) -> Result<ReconcilePass, ReconcileError> {
        let dep = build_deployment(dc, &self.config.pod_template)
            .map_err(|field| ReconcileError::MissingObjectKey { key: key.clone(), field })?;
        info!(ns = %key.namespace, name = %key.name, replicas = dc.spec.replicas, "creating deployment");
        self.store
            .create_managed(&dep)
            .await
            .map_err(|source| ReconcileError::CreateManaged { key: key.clone(), source })?;
        record_write(StoreOp::CreateManaged);
        // Runtime status of a fresh Deployment is unknown yet.
        Ok(ReconcilePass::new(ConvergencePhase::Created, ReconcileOutcome::requeue()))
    }
}

fn record_write(op: StoreOp) {
    counter!("dcop_store_writes_total", 1, "op" => op.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names_are_stable_metric_labels() {
        let all = [
            ConvergencePhase::Deleted,
            ConvergencePhase::Created,
            ConvergencePhase::Drifted,
            ConvergencePhase::StatusSynced,
            ConvergencePhase::Stable,
        ];
        let names: Vec<_> = all.iter().map(|p| p.as_str()).collect();
        assert_eq!(names, vec!["deleted", "created", "drifted", "status_synced", "stable"]);
    }

    #[test]
    fn conflicts_are_recognised() {
        let key = ObjectKey::new("ns", "foo");
        let e = ReconcileError::PatchManaged { key: key.clone(), source: StoreError::Conflict("rv".into()) };
        assert!(e.is_conflict());
        assert_eq!(e.key(), &key);
        let e = ReconcileError::MissingObjectKey { key: key.clone(), field: ".metadata.uid" };
        assert!(!e.is_conflict());
        assert!(e.store_error().is_none());
        assert_eq!(e.to_string(), "DeploymentConfig ns/foo is missing .metadata.uid");
    }
}
