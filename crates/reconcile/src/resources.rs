//! Construction of the managed Deployment and of the mirrored status.

use dcop_core::{labels_for, DeploymentConfig, DeploymentConfigStatus};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::Resource;

/// Stand-in workload used when no pod template is configured.
pub fn placeholder_pod_template() -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: None,
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "busybox".to_string(),
                image: Some("busybox".to_string()),
                command: Some(vec!["sleep".to_string(), "3600".to_string()]),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
    }
}

/// Build the Deployment owned by `dc`.
///
/// Replicas are copied from the desired spec, selector and pod labels come
/// from [`labels_for`], and `dc` is recorded as controlling owner. Errors with
/// the metadata field that is missing from `dc`.
pub fn build_deployment(dc: &DeploymentConfig, template: &PodTemplateSpec) -> Result<Deployment, &'static str> {
    let name = dc.metadata.name.clone().ok_or(".metadata.name")?;
    let namespace = dc.metadata.namespace.clone().ok_or(".metadata.namespace")?;
    // controller_owner_ref needs the uid
    let owner = dc.controller_owner_ref(&()).ok_or(".metadata.uid")?;
    let labels = labels_for(&name);

    let mut template = template.clone();
    let pod_meta = template.metadata.get_or_insert_with(ObjectMeta::default);
    let mut pod_labels = pod_meta.labels.take().unwrap_or_default();
    pod_labels.extend(labels.clone());
    pod_meta.labels = Some(pod_labels);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(dc.spec.replicas),
            selector: LabelSelector { match_labels: Some(labels), ..LabelSelector::default() },
            template,
            ..DeploymentSpec::default()
        }),
        status: None,
    })
}

/// Replica count currently requested by a Deployment, if set.
pub fn spec_replicas(dep: &Deployment) -> Option<i32> {
    dep.spec.as_ref().and_then(|s| s.replicas)
}

/// Status a DeploymentConfig should carry given its Deployment's runtime state.
pub fn status_for(dep: &Deployment) -> DeploymentConfigStatus {
    DeploymentConfigStatus {
        available_replicas: dep.status.as_ref().and_then(|s| s.available_replicas).unwrap_or(0),
    }
}

/// Field-by-field comparison of the stored status against `candidate`.
/// A missing status counts as the zero status.
pub fn status_needs_update(current: Option<&DeploymentConfigStatus>, candidate: &DeploymentConfigStatus) -> bool {
    let current = current.copied().unwrap_or_default();
    current.available_replicas != candidate.available_replicas
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcop_core::DeploymentConfigSpec;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use std::collections::BTreeMap;

    fn dc(name: &str, replicas: i32) -> DeploymentConfig {
        let mut dc = DeploymentConfig::new(name, DeploymentConfigSpec { replicas, message: "hi".into() });
        dc.metadata.namespace = Some("default".into());
        dc.metadata.uid = Some("5a1c0d4e-0000-4000-8000-000000000001".into());
        dc
    }

    #[test]
    fn deployment_mirrors_identity_replicas_and_labels() {
        let dep = build_deployment(&dc("foo", 3), &placeholder_pod_template()).unwrap();
        assert_eq!(dep.metadata.name.as_deref(), Some("foo"));
        assert_eq!(dep.metadata.namespace.as_deref(), Some("default"));
        let spec = dep.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        let want = labels_for("foo");
        assert_eq!(spec.selector.match_labels.as_ref(), Some(&want));
        assert_eq!(spec.template.metadata.unwrap().labels, Some(want));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.containers[0].image.as_deref(), Some("busybox"));
        assert_eq!(pod.containers[0].command, Some(vec!["sleep".to_string(), "3600".to_string()]));
    }

    #[test]
    fn deployment_is_controlled_by_its_config() {
        let owner = dc("foo", 1);
        let dep = build_deployment(&owner, &placeholder_pod_template()).unwrap();
        let refs = dep.metadata.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "DeploymentConfig");
        assert_eq!(refs[0].api_version, "app.stakater.com/v1");
        assert_eq!(refs[0].name, "foo");
        assert_eq!(Some(refs[0].uid.clone()), owner.metadata.uid);
        assert_eq!(refs[0].controller, Some(true));
    }

    #[test]
    fn missing_uid_is_reported() {
        let mut owner = dc("foo", 1);
        owner.metadata.uid = None;
        assert_eq!(build_deployment(&owner, &placeholder_pod_template()).unwrap_err(), ".metadata.uid");
    }

    #[test]
    fn template_labels_are_kept_but_selector_labels_win() {
        let mut tpl = placeholder_pod_template();
        tpl.metadata = Some(ObjectMeta {
            labels: Some(BTreeMap::from([
                ("tier".to_string(), "web".to_string()),
                ("app".to_string(), "something-else".to_string()),
            ])),
            ..ObjectMeta::default()
        });
        let dep = build_deployment(&dc("foo", 1), &tpl).unwrap();
        let labels = dep.spec.unwrap().template.metadata.unwrap().labels.unwrap();
        assert_eq!(labels.get("tier").map(String::as_str), Some("web"));
        assert_eq!(labels.get("app").map(String::as_str), Some("deploymentconfig"));
        assert_eq!(labels.get("deploymentconfig_cr").map(String::as_str), Some("foo"));
    }

    #[test]
    fn status_reads_available_replicas_not_desired() {
        let mut dep = build_deployment(&dc("foo", 5), &placeholder_pod_template()).unwrap();
        assert_eq!(status_for(&dep).available_replicas, 0);
        dep.status = Some(DeploymentStatus { available_replicas: Some(2), replicas: Some(5), ..Default::default() });
        assert_eq!(status_for(&dep).available_replicas, 2);
    }

    #[test]
    fn status_comparison_treats_missing_as_zero() {
        let zero = DeploymentConfigStatus::default();
        let three = DeploymentConfigStatus { available_replicas: 3 };
        assert!(!status_needs_update(None, &zero));
        assert!(status_needs_update(None, &three));
        assert!(!status_needs_update(Some(&three), &three));
        assert!(status_needs_update(Some(&three), &zero));
    }
}
