//! Store capability consumed by the reconciler.

use k8s_openapi::api::apps::v1::Deployment;
use serde::{Deserialize, Serialize};

use crate::{DeploymentConfig, DeploymentConfigStatus, ObjectKey};

/// Classified store failure. Absence on reads is `Ok(None)`, never an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("backend: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Operations of [`ObjectStore`], used for metrics labels and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreOp {
    GetDesired,
    GetManaged,
    CreateManaged,
    PatchManagedReplicas,
    PatchDesiredStatus,
}

impl StoreOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            StoreOp::GetDesired => "get_desired",
            StoreOp::GetManaged => "get_managed",
            StoreOp::CreateManaged => "create_managed",
            StoreOp::PatchManagedReplicas => "patch_managed_replicas",
            StoreOp::PatchDesiredStatus => "patch_desired_status",
        }
    }

    pub const fn is_write(self) -> bool {
        !matches!(self, StoreOp::GetDesired | StoreOp::GetManaged)
    }
}

/// Read/write access to DeploymentConfigs and their Deployments.
///
/// Writes carrying a `resource_version` must fail with [`StoreError::Conflict`]
/// when the stored object has moved on since it was read.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_desired(&self, key: &ObjectKey) -> StoreResult<Option<DeploymentConfig>>;

    async fn get_managed(&self, key: &ObjectKey) -> StoreResult<Option<Deployment>>;

    /// Create a Deployment. An existing object with the same identity is a conflict.
    async fn create_managed(&self, deployment: &Deployment) -> StoreResult<()>;

    /// Set `spec.replicas` of an existing Deployment, touching nothing else.
    async fn patch_managed_replicas(
        &self,
        key: &ObjectKey,
        replicas: i32,
        resource_version: Option<&str>,
    ) -> StoreResult<()>;

    /// Write the status subresource of a DeploymentConfig.
    async fn patch_desired_status(
        &self,
        key: &ObjectKey,
        status: &DeploymentConfigStatus,
        resource_version: Option<&str>,
    ) -> StoreResult<()>;
}
