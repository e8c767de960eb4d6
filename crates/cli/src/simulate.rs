//! Offline convergence runs over a `MemoryStore` seeded from YAML.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use dcop_core::{DeploymentConfig, ObjectKey};
use dcop_reconcile::{spec_replicas, Reconciler, ReconcilerConfig};
use dcop_store::MemoryStore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub max_passes: usize,
    /// Let every Deployment report its spec replicas as available after each pass.
    pub settle: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassRecord {
    pub pass: usize,
    pub object: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<&'static str>,
    pub requeue: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectSummary {
    pub object: String,
    pub desired: i32,
    pub deployment_replicas: Option<i32>,
    pub status_available: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub converged: bool,
    pub passes: Vec<PassRecord>,
    pub objects: Vec<ObjectSummary>,
}

/// Parse a multi-document YAML stream of DeploymentConfigs.
/// Empty documents are skipped; objects without a namespace land in `default_ns`.
pub fn parse_configs(yaml: &str, default_ns: &str) -> Result<Vec<DeploymentConfig>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let n = i + 1;
        let value = serde_yaml::Value::deserialize(doc).with_context(|| format!("document {}", n))?;
        if value.is_null() {
            continue;
        }
        match value.get("kind").and_then(|k| k.as_str()) {
            Some("DeploymentConfig") => {}
            other => bail!("document {}: expected kind DeploymentConfig, got {:?}", n, other),
        }
        let mut dc: DeploymentConfig =
            serde_yaml::from_value(value).with_context(|| format!("document {}: decoding DeploymentConfig", n))?;
        if dc.metadata.name.as_deref().map_or(true, str::is_empty) {
            bail!("document {}: metadata.name is required", n);
        }
        if dc.metadata.namespace.is_none() {
            dc.metadata.namespace = Some(default_ns.to_string());
        }
        out.push(dc);
    }
    Ok(out)
}

/// Drive every identity until it reports `done()` or `max_passes` is reached.
pub async fn simulate(
    configs: Vec<DeploymentConfig>,
    config: ReconcilerConfig,
    opts: &SimulateOptions,
) -> Result<SimulationReport> {
    let store = Arc::new(MemoryStore::new());
    for dc in configs {
        store.apply_desired(dc).map_err(|e| anyhow!("seeding store: {}", e))?;
    }
    let reconciler = Reconciler::new(Arc::clone(&store), config);

    let mut pending: BTreeSet<ObjectKey> = store.desired_keys().into_iter().collect();
    let mut passes = Vec::new();
    for pass in 1..=opts.max_passes {
        if pending.is_empty() {
            break;
        }
        let keys: Vec<ObjectKey> = pending.iter().cloned().collect();
        for key in keys {
            let record = match reconciler.reconcile_pass(&key).await {
                Ok(p) => {
                    if !p.outcome.requeue {
                        pending.remove(&key);
                    }
                    PassRecord { pass, object: key.to_string(), phase: Some(p.phase.as_str()), requeue: p.outcome.requeue, error: None }
                }
                Err(e) => PassRecord { pass, object: key.to_string(), phase: None, requeue: true, error: Some(e.to_string()) },
            };
            passes.push(record);
        }
        if opts.settle {
            store.settle_all();
        }
    }

    let objects = store
        .desired_keys()
        .into_iter()
        .filter_map(|key| {
            let dc = store.desired(&key)?;
            Some(ObjectSummary {
                object: key.to_string(),
                desired: dc.spec.replicas,
                deployment_replicas: store.managed(&key).as_ref().and_then(spec_replicas),
                status_available: dc.status.map(|s| s.available_replicas),
            })
        })
        .collect();
    Ok(SimulationReport { converged: pending.is_empty(), passes, objects })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO: &str = r#"
apiVersion: app.stakater.com/v1
kind: DeploymentConfig
metadata:
  name: web
  namespace: shop
spec:
  replicas: 3
  message: hello
---
apiVersion: app.stakater.com/v1
kind: DeploymentConfig
metadata:
  name: worker
spec:
  replicas: 0
---
"#;

    #[test]
    fn parses_documents_and_defaults_namespace() {
        let dcs = parse_configs(TWO, "default").unwrap();
        assert_eq!(dcs.len(), 2);
        assert_eq!(dcs[0].metadata.namespace.as_deref(), Some("shop"));
        assert_eq!(dcs[0].spec.message, "hello");
        assert_eq!(dcs[1].metadata.namespace.as_deref(), Some("default"));
        assert_eq!(dcs[1].spec.replicas, 0);
    }

    #[test]
    fn rejects_foreign_kinds_and_nameless_objects() {
        let e = parse_configs("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n", "default").unwrap_err();
        assert!(e.to_string().contains("expected kind DeploymentConfig"), "{}", e);
        let e = parse_configs("kind: DeploymentConfig\nmetadata: {}\nspec:\n  replicas: 1\n", "default").unwrap_err();
        assert!(e.to_string().contains("metadata.name"), "{}", e);
    }

    #[tokio::test]
    async fn settled_run_converges_with_synced_status() {
        let dcs = parse_configs(TWO, "default").unwrap();
        let opts = SimulateOptions { max_passes: 10, settle: true };
        let report = simulate(dcs, ReconcilerConfig::default(), &opts).await.unwrap();
        assert!(report.converged);
        let web: Vec<_> = report.passes.iter().filter(|p| p.object == "shop/web").map(|p| p.phase).collect();
        assert_eq!(web, vec![Some("created"), Some("status_synced")]);
        // zero replicas settle to zero available, which equals the missing status
        let worker: Vec<_> = report.passes.iter().filter(|p| p.object == "default/worker").map(|p| p.phase).collect();
        assert_eq!(worker, vec![Some("created"), Some("stable")]);

        let web = report.objects.iter().find(|o| o.object == "shop/web").unwrap();
        assert_eq!(web.deployment_replicas, Some(3));
        assert_eq!(web.status_available, Some(3));
    }

    #[tokio::test]
    async fn negative_replicas_fail_before_any_pass() {
        let y = "kind: DeploymentConfig\nmetadata:\n  name: web\nspec:\n  replicas: -1\n";
        let dcs = parse_configs(y, "default").unwrap();
        let opts = SimulateOptions { max_passes: 3, settle: true };
        let e = simulate(dcs, ReconcilerConfig::default(), &opts).await.unwrap_err();
        assert!(e.to_string().contains("replicas must be >= 0"), "{}", e);
    }

    #[tokio::test]
    async fn pass_limit_reports_unconverged() {
        let dcs = parse_configs(TWO, "default").unwrap();
        let opts = SimulateOptions { max_passes: 1, settle: false };
        let report = simulate(dcs, ReconcilerConfig::default(), &opts).await.unwrap();
        assert!(!report.converged);
        assert_eq!(report.passes.len(), 2);
        assert!(report.passes.iter().all(|p| p.requeue));
    }
}
