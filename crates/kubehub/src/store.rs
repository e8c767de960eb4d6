//! `ObjectStore` backed by the Kubernetes API server.

use async_trait::async_trait;
use dcop_core::{DeploymentConfig, DeploymentConfigStatus, ObjectKey, ObjectStore, StoreError, StoreResult};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    Client,
};
use serde_json::{json, Value};
use tracing::debug;

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into() }
    }

    fn configs(&self, ns: &str) -> Api<DeploymentConfig> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn deployments(&self, ns: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams { field_manager: Some(self.field_manager.clone()), ..PatchParams::default() }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_desired(&self, key: &ObjectKey) -> StoreResult<Option<DeploymentConfig>> {
        self.configs(&key.namespace).get_opt(&key.name).await.map_err(store_error)
    }

    async fn get_managed(&self, key: &ObjectKey) -> StoreResult<Option<Deployment>> {
        self.deployments(&key.namespace).get_opt(&key.name).await.map_err(store_error)
    }

    async fn create_managed(&self, deployment: &Deployment) -> StoreResult<()> {
        let ns = deployment
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| StoreError::Invalid("deployment without namespace".into()))?;
        let pp = PostParams { field_manager: Some(self.field_manager.clone()), ..PostParams::default() };
        self.deployments(ns).create(&pp, deployment).await.map_err(store_error)?;
        Ok(())
    }

    async fn patch_managed_replicas(&self, key: &ObjectKey, replicas: i32, rv: Option<&str>) -> StoreResult<()> {
        let payload = guarded(json!({"spec": {"replicas": replicas}}), rv);
        debug!(ns = %key.namespace, name = %key.name, replicas, "patching deployment replicas");
        self.deployments(&key.namespace)
            .patch(&key.name, &self.patch_params(), &Patch::Merge(&payload))
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn patch_desired_status(
        &self,
        key: &ObjectKey,
        status: &DeploymentConfigStatus,
        rv: Option<&str>,
    ) -> StoreResult<()> {
        let payload = guarded(json!({ "status": status }), rv);
        self.configs(&key.namespace)
            .patch_status(&key.name, &self.patch_params(), &Patch::Merge(&payload))
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

/// Add `metadata.resourceVersion` so the server rejects the patch if the object moved on.
fn guarded(mut payload: Value, rv: Option<&str>) -> Value {
    if let (Some(rv), Some(obj)) = (rv, payload.as_object_mut()) {
        obj.insert("metadata".into(), json!({ "resourceVersion": rv }));
    }
    payload
}

/// Classify a kube client error by HTTP status.
pub fn store_error(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message),
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => StoreError::Invalid(ae.message),
        other => StoreError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} happened", reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn api_errors_map_by_status_code() {
        assert_eq!(store_error(api_error(409, "Conflict")), StoreError::Conflict("Conflict happened".into()));
        assert_eq!(store_error(api_error(409, "AlreadyExists")), StoreError::Conflict("AlreadyExists happened".into()));
        assert_eq!(store_error(api_error(404, "NotFound")), StoreError::NotFound("NotFound happened".into()));
        assert_eq!(store_error(api_error(422, "Invalid")), StoreError::Invalid("Invalid happened".into()));
        assert_eq!(store_error(api_error(400, "BadRequest")), StoreError::Invalid("BadRequest happened".into()));
        assert!(matches!(store_error(api_error(500, "InternalError")), StoreError::Backend(_)));
        assert!(matches!(store_error(api_error(429, "TooManyRequests")), StoreError::Backend(_)));
    }

    #[test]
    fn patches_carry_resource_version_when_known() {
        let p = guarded(json!({"spec": {"replicas": 3}}), Some("42"));
        assert_eq!(p, json!({"spec": {"replicas": 3}, "metadata": {"resourceVersion": "42"}}));
        let p = guarded(json!({"spec": {"replicas": 3}}), None);
        assert_eq!(p, json!({"spec": {"replicas": 3}}));
    }

    #[test]
    fn status_payload_is_camel_case() {
        let status = DeploymentConfigStatus { available_replicas: 2 };
        let p = guarded(json!({ "status": status }), Some("7"));
        assert_eq!(p["status"]["availableReplicas"], 2);
        assert_eq!(p["metadata"]["resourceVersion"], "7");
    }
}
