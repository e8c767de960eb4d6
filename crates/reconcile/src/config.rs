use std::path::Path;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::PodTemplateSpec;

use crate::resources::placeholder_pod_template;

/// Reconciler settings. Timing belongs to the dispatcher and is not here.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    /// Workload stamped into every newly created Deployment.
    pub pod_template: PodTemplateSpec,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { pod_template: placeholder_pod_template() }
    }
}

impl ReconcilerConfig {
    /// Defaults, with the pod template read from `DCOP_POD_TEMPLATE` when set.
    pub fn from_env() -> Result<Self> {
        match std::env::var("DCOP_POD_TEMPLATE") {
            Ok(path) if !path.is_empty() => Ok(Self { pod_template: load_pod_template(path)? }),
            _ => Ok(Self::default()),
        }
    }

    pub fn with_pod_template(mut self, pod_template: PodTemplateSpec) -> Self {
        self.pod_template = pod_template;
        self
    }
}

pub fn load_pod_template(path: impl AsRef<Path>) -> Result<PodTemplateSpec> {
    let path = path.as_ref();
    let yaml = std::fs::read_to_string(path).with_context(|| format!("reading pod template {}", path.display()))?;
    parse_pod_template(&yaml).with_context(|| format!("loading pod template {}", path.display()))
}

/// Parse a YAML `PodTemplateSpec`. At least one container is required.
pub fn parse_pod_template(yaml: &str) -> Result<PodTemplateSpec> {
    let tpl: PodTemplateSpec = serde_yaml::from_str(yaml).context("parsing YAML")?;
    let containers = tpl.spec.as_ref().map(|s| s.containers.len()).unwrap_or(0);
    if containers == 0 {
        return Err(anyhow!("pod template must declare at least one container"));
    }
    Ok(tpl)
}
