//! dcop kubehub: API-server store and controller wiring for DeploymentConfigs.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use dcop_core::{DeploymentConfig, ObjectKey, ReconcileOutcome};
use dcop_reconcile::{ReconcileError, Reconciler, ReconcilerConfig};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::Api,
    runtime::{
        controller::{self, Action, Controller},
        watcher,
    },
    Client, CustomResourceExt,
};
use metrics::counter;
use tracing::{debug, info, warn};

mod store;

pub use store::{store_error, KubeStore};

/// Dispatcher settings for [`run_controller`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Watch a single namespace; `None` watches all of them.
    pub namespace: Option<String>,
    /// Identities reconciled in parallel.
    pub concurrency: u16,
    /// Delay for `requeue()` outcomes and lost write races.
    pub requeue_delay: Duration,
    /// Delay after any other reconcile error.
    pub error_backoff: Duration,
    pub field_manager: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            concurrency: 4,
            requeue_delay: Duration::from_secs(5),
            error_backoff: Duration::from_secs(15),
            field_manager: "dcop".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `DCOP_*` variables. Unparsable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let secs = |k: &str, default: Duration| {
            get(k).and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(default)
        };
        Self {
            namespace: get("DCOP_NAMESPACE").filter(|s| !s.is_empty()),
            concurrency: get("DCOP_CONCURRENCY").and_then(|s| s.parse().ok()).unwrap_or(d.concurrency),
            requeue_delay: secs("DCOP_REQUEUE_SECS", d.requeue_delay),
            error_backoff: secs("DCOP_ERROR_BACKOFF_SECS", d.error_backoff),
            field_manager: get("DCOP_FIELD_MANAGER").filter(|s| !s.is_empty()).unwrap_or(d.field_manager),
        }
    }
}

/// Map a reconcile outcome onto a kube-runtime action.
pub fn outcome_to_action(outcome: ReconcileOutcome, cfg: &ControllerConfig) -> Action {
    if outcome.requeue {
        Action::requeue(outcome.requeue_after.unwrap_or(cfg.requeue_delay))
    } else {
        Action::await_change()
    }
}

/// Requeue delay after a failed reconcile.
pub fn error_action(error: &ControllerError, cfg: &ControllerConfig) -> Action {
    match error {
        ControllerError::Reconcile(e) if e.is_conflict() => Action::requeue(cfg.requeue_delay),
        _ => Action::requeue(cfg.error_backoff),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("watched object is missing {0}")]
    MissingObjectKey(&'static str),
}

struct Context {
    reconciler: Reconciler<KubeStore>,
    config: ControllerConfig,
}

async fn reconcile_object(obj: Arc<DeploymentConfig>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    // The cached object only names the identity; the reconciler reads fresh state.
    let key = ObjectKey::from_resource(obj.as_ref()).map_err(ControllerError::MissingObjectKey)?;
    let outcome = ctx.reconciler.reconcile(&key).await?;
    Ok(outcome_to_action(outcome, &ctx.config))
}

fn error_policy(_obj: Arc<DeploymentConfig>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    counter!("dcop_controller_errors_total", 1);
    error_action(error, &ctx.config)
}

/// Build the API-server backed reconciler for `client`.
pub fn kube_reconciler(client: Client, config: ReconcilerConfig, cfg: &ControllerConfig) -> Reconciler<KubeStore> {
    Reconciler::new(Arc::new(KubeStore::new(client, cfg.field_manager.clone())), config)
}

/// Watch DeploymentConfigs and their owned Deployments and reconcile until a signal arrives.
pub async fn run_controller(client: Client, reconciler: Reconciler<KubeStore>, cfg: ControllerConfig) -> Result<()> {
    let (configs, deployments): (Api<DeploymentConfig>, Api<Deployment>) = match cfg.namespace.as_deref() {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client, ns)),
        None => (Api::all(client.clone()), Api::all(client)),
    };
    // Fail fast when the CRD is not installed.
    configs
        .list(&kube::api::ListParams::default().limit(1))
        .await
        .context("listing DeploymentConfigs; is the CRD installed? (dcopctl crd | kubectl apply -f -)")?;

    info!(ns = ?cfg.namespace, concurrency = cfg.concurrency, "starting deploymentconfig controller");
    let ctx = Arc::new(Context { reconciler, config: cfg.clone() });
    Controller::new(configs, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .with_config(controller::Config::default().concurrency(cfg.concurrency))
        .shutdown_on_signal()
        .run(reconcile_object, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(object = %obj, action = ?action, "reconciled"),
                Err(controller::Error::ReconcilerFailed(e, obj)) => {
                    debug!(object = %obj, error = %e, "reconcile failed; requeued")
                }
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;
    info!("controller terminated");
    Ok(())
}

/// CustomResourceDefinition manifest for DeploymentConfig.
pub fn crd_yaml() -> Result<String> {
    serde_yaml::to_string(&DeploymentConfig::crd()).context("serializing CRD")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcop_core::StoreError;
    use std::collections::HashMap;

    #[test]
    fn outcomes_map_to_actions() {
        let cfg = ControllerConfig::default();
        assert_eq!(outcome_to_action(ReconcileOutcome::done(), &cfg), Action::await_change());
        assert_eq!(outcome_to_action(ReconcileOutcome::requeue(), &cfg), Action::requeue(Duration::from_secs(5)));
        assert_eq!(
            outcome_to_action(ReconcileOutcome::requeue_after(Duration::from_millis(250)), &cfg),
            Action::requeue(Duration::from_millis(250))
        );
    }

    #[test]
    fn conflicts_retry_sooner_than_other_errors() {
        let cfg = ControllerConfig::default();
        let key = ObjectKey::new("ns", "foo");
        let conflict = ControllerError::from(ReconcileError::PatchManaged {
            key: key.clone(),
            source: StoreError::Conflict("rv".into()),
        });
        assert_eq!(error_action(&conflict, &cfg), Action::requeue(cfg.requeue_delay));
        let backend = ControllerError::from(ReconcileError::FetchManaged { key, source: StoreError::Backend("eof".into()) });
        assert_eq!(error_action(&backend, &cfg), Action::requeue(cfg.error_backoff));
        let missing = ControllerError::MissingObjectKey(".metadata.namespace");
        assert_eq!(error_action(&missing, &cfg), Action::requeue(cfg.error_backoff));
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DCOP_NAMESPACE", "apps"),
            ("DCOP_CONCURRENCY", "16"),
            ("DCOP_REQUEUE_SECS", "1"),
            ("DCOP_ERROR_BACKOFF_SECS", "soon"),
            ("DCOP_FIELD_MANAGER", ""),
        ]);
        let cfg = ControllerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.namespace.as_deref(), Some("apps"));
        assert_eq!(cfg.concurrency, 16);
        assert_eq!(cfg.requeue_delay, Duration::from_secs(1));
        assert_eq!(cfg.error_backoff, ControllerConfig::default().error_backoff);
        assert_eq!(cfg.field_manager, "dcop");
        assert_eq!(ControllerConfig::from_lookup(|_| None), ControllerConfig::default());
    }

    #[test]
    fn crd_manifest_names_group_and_status() {
        let y = crd_yaml().unwrap();
        assert!(y.contains("name: deploymentconfigs.app.stakater.com"), "{}", y);
        assert!(y.contains("kind: DeploymentConfig"));
        assert!(y.contains("status: {}"));
    }
}
