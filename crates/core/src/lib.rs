//! dcop core types: the DeploymentConfig resource, object identity, the
//! reconcile outcome and the store capability the reconciler is built on.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod store;

pub use store::{ObjectStore, StoreError, StoreOp, StoreResult};

/// Label carrying the fixed category of every managed Deployment.
pub const CATEGORY_LABEL: &str = "app";
/// Value of [`CATEGORY_LABEL`].
pub const CATEGORY_VALUE: &str = "deploymentconfig";
/// Label carrying the owning DeploymentConfig's name.
pub const IDENTITY_LABEL: &str = "deploymentconfig_cr";

/// Desired state for one managed Deployment.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "app.stakater.com", version = "v1", kind = "DeploymentConfig", namespaced)]
#[kube(shortname = "dc", status = "DeploymentConfigStatus")]
#[kube(printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.replicas"}"#)]
#[kube(printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.availableReplicas"}"#)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigSpec {
    #[schemars(range(min = 0))]
    pub replicas: i32,
    /// Free text, only logged.
    #[serde(default)]
    pub message: String,
}

/// Observed state mirrored from the managed Deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigStatus {
    #[serde(default)]
    pub available_replicas: i32,
}

/// Namespaced identity shared by a DeploymentConfig and its Deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Identity of any namespaced object. Errors with the missing field path.
    pub fn from_resource<K: Resource>(obj: &K) -> Result<Self, &'static str> {
        let meta = obj.meta();
        let namespace = meta.namespace.clone().ok_or(".metadata.namespace")?;
        let name = meta.name.clone().ok_or(".metadata.name")?;
        Ok(Self { namespace, name })
    }

    /// Split `namespace/name`. Both parts must be non-empty; no further validation.
    pub fn parse(s: &str) -> Option<Self> {
        let (ns, name) = s.split_once('/')?;
        if ns.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(ns, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Labels selecting the Deployment that belongs to the DeploymentConfig `name`.
pub fn labels_for(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CATEGORY_LABEL.to_string(), CATEGORY_VALUE.to_string()),
        (IDENTITY_LABEL.to_string(), name.to_string()),
    ])
}

/// What the dispatcher should do after one reconcile call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub requeue: bool,
    /// Explicit delay; `None` leaves the delay to the dispatcher.
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    /// Nothing left to do until the next change.
    pub const fn done() -> Self {
        Self { requeue: false, requeue_after: None }
    }

    /// More convergence work is expected soon.
    pub const fn requeue() -> Self {
        Self { requeue: true, requeue_after: None }
    }

    pub const fn requeue_after(delay: Duration) -> Self {
        Self { requeue: true, requeue_after: Some(delay) }
    }
}
