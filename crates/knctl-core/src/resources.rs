//! Knative serving resource model
//!
//! Typed views of the `serving.knative.dev/v1` resources this client reads and
//! writes: [`Service`], [`Revision`], [`Configuration`] and [`Route`].
//!
//! The revision spec inlines a Kubernetes `PodSpec`, so every container field
//! the edit flags touch is strongly typed. Conditions use Knative's own shape
//! (reason and message are optional), not `meta/v1` conditions.

use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{CustomResource, Resource};
use serde::{Deserialize, Serialize};

use crate::annotations::serving;

/// API version of every serving resource
pub const SERVING_API_VERSION: &str = "serving.knative.dev/v1";

/// The condition whose resolution concludes a wait
pub const READY_CONDITION: &str = "Ready";

// ========== Service ==========

/// Top-level user-managed workload: a revision template plus a routing table
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Service",
    shortname = "ksvc",
    namespaced,
    schema = "disabled",
    status = "ServiceStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Template stamped into a new revision whenever it changes
    #[serde(default)]
    pub template: RevisionTemplateSpec,

    /// Ordered routing table; empty means 100% to the latest ready revision
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic: Vec<TrafficTarget>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Public URL of the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Cluster-internal address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Addressable>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_created_revision_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_ready_revision_name: Option<String>,

    /// Routing table as resolved by the server (latest revision made concrete)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic: Vec<TrafficTarget>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Addressable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Template for the next revision of a service
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RevisionTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: RevisionSpec,
}

// ========== Revision ==========

/// Immutable snapshot of a service's template at a generation
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Revision",
    shortname = "rev",
    namespaced,
    schema = "disabled",
    status = "RevisionStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct RevisionSpec {
    /// Inlined pod spec: containers, volumes, service account, ...
    #[serde(flatten)]
    pub pod_spec: PodSpec,

    /// Hard limit of concurrent requests per container (0 = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_concurrency: Option<i64>,

    /// Maximum request duration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RevisionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Digest the first container's image resolved to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub container_statuses: Vec<ContainerStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
}

// ========== Configuration ==========

/// Server-maintained aggregation of a service's revisions
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Configuration",
    shortname = "config",
    namespaced,
    schema = "disabled",
    status = "ConfigurationStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSpec {
    #[serde(default)]
    pub template: RevisionTemplateSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_created_revision_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_ready_revision_name: Option<String>,
}

// ========== Route ==========

/// Routing table of a service, materialized server-side
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "serving.knative.dev",
    version = "v1",
    kind = "Route",
    namespaced,
    schema = "disabled",
    status = "RouteStatus",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic: Vec<TrafficTarget>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Addressable>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traffic: Vec<TrafficTarget>,
}

// ========== Shared types ==========

/// One entry of a routing table
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficTarget {
    /// Name for a dedicated URL of this target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Concrete revision receiving traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_name: Option<String>,

    /// Follow the latest ready revision instead of a named one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_revision: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<i64>,

    /// Tag URL, filled in by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl TrafficTarget {
    /// Target following the latest ready revision
    pub fn latest(percent: i64) -> Self {
        Self {
            latest_revision: Some(true),
            percent: Some(percent),
            ..Default::default()
        }
    }

    /// Target pinned to a named revision
    pub fn revision(name: impl Into<String>, percent: i64) -> Self {
        Self {
            revision_name: Some(name.into()),
            latest_revision: Some(false),
            percent: Some(percent),
            ..Default::default()
        }
    }

    /// Attach a tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Whether this target follows the latest revision
    pub fn is_latest(&self) -> bool {
        self.latest_revision == Some(true)
    }

    /// Percent of traffic, absent counting as zero
    pub fn percent_or_zero(&self) -> i64 {
        self.percent.unwrap_or(0)
    }
}

/// Status of a condition
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        })
    }
}

/// Knative condition
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default)]
    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Error, Warning or Info; empty means Error for the Ready condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

impl Condition {
    /// Build a condition, mostly useful in tests
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        Self {
            type_: type_.into(),
            status,
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self.message = Some(message.into());
        self
    }
}

// ========== Readiness ==========

/// Resources whose status carries conditions and an observed generation
pub trait Conditioned: Resource<DynamicType = ()> {
    /// Conditions reported by the server, empty before the first reconcile
    fn conditions(&self) -> &[Condition];

    /// Generation the conditions describe
    fn observed_generation(&self) -> Option<i64>;

    /// The `Ready` condition, if reported
    fn ready_condition(&self) -> Option<&Condition> {
        self.conditions()
            .iter()
            .find(|c| c.type_ == READY_CONDITION)
    }

    /// Whether the status describes the current spec
    ///
    /// A status computed for a previous generation must not be trusted.
    fn is_generation_observed(&self) -> bool {
        self.meta().generation == self.observed_generation()
    }

    /// Ready=True for the current generation
    fn is_ready(&self) -> bool {
        self.is_generation_observed()
            && self
                .ready_condition()
                .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

macro_rules! impl_conditioned {
    ($kind:ty) => {
        impl Conditioned for $kind {
            fn conditions(&self) -> &[Condition] {
                self.status
                    .as_ref()
                    .map(|s| s.conditions.as_slice())
                    .unwrap_or_default()
            }

            fn observed_generation(&self) -> Option<i64> {
                self.status.as_ref().and_then(|s| s.observed_generation)
            }
        }
    };
}

impl_conditioned!(Service);
impl_conditioned!(Revision);
impl_conditioned!(Configuration);
impl_conditioned!(Route);

// ========== Helpers ==========

impl Service {
    /// Create a service in a namespace with a single container image
    pub fn with_image(name: &str, namespace: &str, image: &str) -> Self {
        let mut service = Service::new(name, ServiceSpec::default());
        service.metadata.namespace = Some(namespace.to_string());
        service.first_container_mut().image = Some(image.to_string());
        service
    }

    /// Public URL from status
    pub fn url(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.url.as_deref())
    }

    pub fn latest_created_revision(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.latest_created_revision_name.as_deref())
    }

    pub fn latest_ready_revision(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.latest_ready_revision_name.as_deref())
    }

    /// Traffic as resolved by the server, falling back to the spec table
    pub fn effective_traffic(&self) -> &[TrafficTarget] {
        match &self.status {
            Some(status) if !status.traffic.is_empty() => &status.traffic,
            _ => &self.spec.traffic,
        }
    }

    /// First container of the template, if any
    pub fn first_container(&self) -> Option<&Container> {
        self.spec.template.spec.pod_spec.containers.first()
    }

    /// First container of the template, created when missing
    pub fn first_container_mut(&mut self) -> &mut Container {
        first_container_mut(&mut self.spec.template.spec.pod_spec)
    }

    /// Image of the first container
    pub fn image(&self) -> Option<&str> {
        self.first_container().and_then(|c| c.image.as_deref())
    }

    /// Whether a deletion is already in progress
    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

impl Revision {
    /// Parent service name from labels
    pub fn service_name(&self) -> Option<&str> {
        label(&self.metadata, serving::SERVICE_LABEL)
    }

    /// Configuration generation the revision was stamped from, 0 when unknown
    pub fn configuration_generation(&self) -> i64 {
        label(&self.metadata, serving::CONFIGURATION_GENERATION_LABEL)
            .and_then(|g| g.parse().ok())
            .unwrap_or(0)
    }

    /// Image of the first container
    pub fn image(&self) -> Option<&str> {
        self.spec
            .pod_spec
            .containers
            .first()
            .and_then(|c| c.image.as_deref())
    }

    /// Resolved digest of the first container image
    pub fn image_digest(&self) -> Option<&str> {
        let status = self.status.as_ref()?;
        status
            .container_statuses
            .first()
            .and_then(|c| c.image_digest.as_deref())
            .or(status.image_digest.as_deref())
    }
}

/// First container of a pod spec, created when missing
pub fn first_container_mut(pod_spec: &mut PodSpec) -> &mut Container {
    if pod_spec.containers.is_empty() {
        pod_spec.containers.push(Container::default());
    }
    &mut pod_spec.containers[0]
}

/// Get a label value from object metadata
pub fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

/// `namespace/name` key used for stable ordering
pub fn sort_key(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_service(generation: i64, observed: i64, status: ConditionStatus) -> Service {
        let mut service = Service::with_image("foo", "default", "gcr.io/foo/bar:baz");
        service.metadata.generation = Some(generation);
        service.status = Some(ServiceStatus {
            observed_generation: Some(observed),
            conditions: vec![Condition::new(READY_CONDITION, status)],
            ..Default::default()
        });
        service
    }

    #[test]
    fn test_service_yaml_roundtrip_keeps_pod_spec_inline() {
        let yaml = r#"
apiVersion: serving.knative.dev/v1
kind: Service
metadata:
  name: foo
  namespace: default
spec:
  template:
    metadata:
      annotations:
        autoscaling.knative.dev/minScale: "1"
    spec:
      containerConcurrency: 10
      serviceAccountName: builder
      containers:
        - image: gcr.io/foo/bar:baz
          env:
            - name: A
              value: mouse
  traffic:
    - latestRevision: true
      percent: 100
"#;
        let service: Service = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(service.image(), Some("gcr.io/foo/bar:baz"));
        assert_eq!(service.spec.template.spec.container_concurrency, Some(10));
        assert_eq!(
            service.spec.template.spec.pod_spec.service_account_name.as_deref(),
            Some("builder")
        );
        assert!(service.spec.traffic[0].is_latest());

        let json = serde_json::to_value(&service).unwrap();
        assert_eq!(json["apiVersion"], "serving.knative.dev/v1");
        assert_eq!(json["kind"], "Service");
        assert_eq!(json["spec"]["template"]["spec"]["serviceAccountName"], "builder");
        assert_eq!(json["spec"]["template"]["spec"]["containerConcurrency"], 10);
        assert!(json["spec"]["template"]["spec"].get("podSpec").is_none());
    }

    #[test]
    fn test_condition_deserializes_without_reason() {
        let condition: Condition =
            serde_json::from_str(r#"{"type":"Ready","status":"Unknown"}"#).unwrap();
        assert_eq!(condition.status, ConditionStatus::Unknown);
        assert!(condition.reason.is_none());
    }

    #[test]
    fn test_is_ready_requires_observed_generation() {
        assert!(ready_service(2, 2, ConditionStatus::True).is_ready());
        assert!(!ready_service(3, 2, ConditionStatus::True).is_ready());
        assert!(!ready_service(2, 2, ConditionStatus::False).is_ready());
    }

    #[test]
    fn test_effective_traffic_prefers_status() {
        let mut service = Service::with_image("foo", "default", "img");
        service.spec.traffic = vec![TrafficTarget::latest(100)];
        assert!(service.effective_traffic()[0].is_latest());

        service.status = Some(ServiceStatus {
            traffic: vec![TrafficTarget::revision("foo-00001", 100)],
            ..Default::default()
        });
        assert_eq!(
            service.effective_traffic()[0].revision_name.as_deref(),
            Some("foo-00001")
        );
    }

    #[test]
    fn test_revision_configuration_generation() {
        let mut revision = Revision::new("foo-00002", RevisionSpec::default());
        assert_eq!(revision.configuration_generation(), 0);

        revision.metadata.labels = Some(
            [
                (serving::CONFIGURATION_GENERATION_LABEL.to_string(), "2".to_string()),
                (serving::SERVICE_LABEL.to_string(), "foo".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(revision.configuration_generation(), 2);
        assert_eq!(revision.service_name(), Some("foo"));
    }

    #[test]
    fn test_revision_image_digest_prefers_container_status() {
        let mut revision = Revision::new("foo-00001", RevisionSpec::default());
        revision.status = Some(RevisionStatus {
            image_digest: Some("gcr.io/foo/bar@sha256:old".to_string()),
            container_statuses: vec![ContainerStatus {
                name: "user-container".to_string(),
                image_digest: Some("gcr.io/foo/bar@sha256:new".to_string()),
            }],
            ..Default::default()
        });
        assert_eq!(revision.image_digest(), Some("gcr.io/foo/bar@sha256:new"));
    }
}
