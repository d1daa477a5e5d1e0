//! Well-known annotation and label keys
//!
//! Knative resources are steered through annotations on the service and on the
//! revision template. Keys are grouped by the component that owns them.

use std::collections::BTreeMap;

/// Keys written by this client
pub mod client {
    /// Canonical serialization of the last applied service, baseline for apply
    pub const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";
    /// Image the user last asked for, before any digest pinning
    pub const USER_IMAGE: &str = "client.knative.dev/user-image";
}

/// Keys owned by the serving control plane
pub mod serving {
    /// User that created the service
    pub const CREATOR: &str = "serving.knative.dev/creator";
    /// User that last modified the service
    pub const LAST_MODIFIER: &str = "serving.knative.dev/lastModifier";
    /// Label: parent service of a revision
    pub const SERVICE_LABEL: &str = "serving.knative.dev/service";
    /// Label: parent configuration of a revision
    pub const CONFIGURATION_LABEL: &str = "serving.knative.dev/configuration";
    /// Label: configuration generation a revision was stamped from
    pub const CONFIGURATION_GENERATION_LABEL: &str =
        "serving.knative.dev/configurationGeneration";
    /// Label: service UID, used when recreating revisions
    pub const SERVICE_UID_LABEL: &str = "serving.knative.dev/serviceUID";
    /// Label: route that references a revision
    pub const ROUTE_LABEL: &str = "serving.knative.dev/route";
}

/// Keys owned by the networking layer
pub mod networking {
    /// Visibility label on the service
    pub const VISIBILITY_LABEL: &str = "networking.knative.dev/visibility";
    /// Value of [`VISIBILITY_LABEL`] that keeps a service cluster-local
    pub const VISIBILITY_CLUSTER_LOCAL: &str = "cluster-local";
}

/// Autoscaling knobs, valid only on the revision template
pub mod autoscaling {
    /// Common prefix of every autoscaling annotation
    pub const PREFIX: &str = "autoscaling.knative.dev/";
    pub const MIN_SCALE: &str = "autoscaling.knative.dev/minScale";
    pub const MAX_SCALE: &str = "autoscaling.knative.dev/maxScale";
    pub const INITIAL_SCALE: &str = "autoscaling.knative.dev/initialScale";
    /// Kebab-case spelling accepted by newer control planes
    pub const INITIAL_SCALE_KEBAB: &str = "autoscaling.knative.dev/initial-scale";
    pub const TARGET: &str = "autoscaling.knative.dev/target";
    pub const WINDOW: &str = "autoscaling.knative.dev/window";
    pub const TARGET_UTILIZATION: &str =
        "autoscaling.knative.dev/targetUtilizationPercentage";
}

/// Check whether an annotation key belongs to the autoscaler
pub fn is_autoscaling_key(key: &str) -> bool {
    key.starts_with(autoscaling::PREFIX)
}

/// Check whether an annotation key requests an initial scale
pub fn is_initial_scale_key(key: &str) -> bool {
    key == autoscaling::INITIAL_SCALE || key == autoscaling::INITIAL_SCALE_KEBAB
}

/// Get an annotation value from optional metadata annotations
pub fn get<'a>(annotations: &'a Option<BTreeMap<String, String>>, key: &str) -> Option<&'a str> {
    annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}
