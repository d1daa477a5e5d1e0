//! Canonical serialization of services
//!
//! The last-applied annotation must hold exactly what the user authored, so a
//! later diff against a freshly built service is clean. [`canonical_value`]
//! serializes a service and strips everything the server or the serializer
//! adds on its own.

use serde_json::{Map, Value};

use crate::annotations::client;
use crate::error::Result;
use crate::resources::Service;

/// Metadata fields owned by the server
const SERVER_METADATA: &[&str] = &[
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "generation",
    "managedFields",
    "resourceVersion",
    "selfLink",
    "uid",
];

/// Serialize a service without status, server metadata, empty structs and
/// its own last-applied annotation
pub fn canonical_value(service: &Service) -> Result<Value> {
    let mut value = serde_json::to_value(service)?;
    if let Some(object) = value.as_object_mut() {
        object.remove("status");
        if let Some(meta) = object.get_mut("metadata") {
            strip_server_metadata(meta);
            remove_annotation(meta, client::LAST_APPLIED);
        }
        prune_metadata(object);

        if let Some(template) = object
            .get_mut("spec")
            .and_then(Value::as_object_mut)
            .and_then(|s| s.get_mut("template"))
            .and_then(Value::as_object_mut)
        {
            if let Some(meta) = template.get_mut("metadata") {
                strip_server_metadata(meta);
            }
            prune_metadata(template);
            if let Some(spec) = template.get_mut("spec") {
                strip_empty_pod_fields(spec);
            }
        }
    }
    Ok(value)
}

/// Canonical JSON text of a service, keys sorted
pub fn canonical_json(service: &Service) -> Result<String> {
    Ok(serde_json::to_string(&canonical_value(service)?)?)
}

/// Record the service's own canonical form under the last-applied annotation
pub fn annotate_last_applied(service: &mut Service) -> Result<()> {
    let json = canonical_json(service)?;
    service
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(client::LAST_APPLIED.to_string(), json);
    Ok(())
}

/// Parse the last-applied annotation, `None` when absent
pub fn last_applied(service: &Service) -> Option<Result<Value>> {
    crate::annotations::get(&service.metadata.annotations, client::LAST_APPLIED)
        .map(|raw| serde_json::from_str(raw).map_err(Into::into))
}

/// Remove server-owned fields from a metadata object
pub fn strip_server_metadata(meta: &mut Value) {
    if let Some(meta) = meta.as_object_mut() {
        for field in SERVER_METADATA {
            meta.remove(*field);
        }
    }
}

/// Remove one annotation from a metadata object
pub fn remove_annotation(meta: &mut Value, key: &str) {
    if let Some(annotations) = meta.get_mut("annotations").and_then(Value::as_object_mut) {
        annotations.remove(key);
    }
}

/// Drop empty container names and empty `resources` from a pod spec object
pub fn strip_empty_pod_fields(pod_spec: &mut Value) {
    let Some(containers) = pod_spec.get_mut("containers").and_then(Value::as_array_mut) else {
        return;
    };
    for container in containers.iter_mut().filter_map(Value::as_object_mut) {
        if container.get("name").and_then(Value::as_str) == Some("") {
            container.remove("name");
        }
        if container
            .get("resources")
            .is_some_and(is_empty_object)
        {
            container.remove("resources");
        }
    }
}

/// Drop empty label and annotation maps, then the metadata itself if empty
pub fn prune_metadata(object: &mut Map<String, Value>) {
    let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    meta.retain(|key, value| {
        !(matches!(key.as_str(), "labels" | "annotations") && is_empty_object(value))
    });
    if meta.is_empty() {
        object.remove("metadata");
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_some_and(Map::is_empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Condition, ConditionStatus, ServiceStatus};
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn server_side_service() -> Service {
        let mut service = Service::with_image("foo", "default", "gcr.io/foo/bar:baz");
        service.metadata.resource_version = Some("42".into());
        service.metadata.uid = Some("abc".into());
        service.metadata.generation = Some(3);
        service.metadata.creation_timestamp = Some(Time(chrono_now()));
        service.spec.template.metadata.creation_timestamp = Some(Time(chrono_now()));
        service.first_container_mut().resources = Some(ResourceRequirements::default());
        service.status = Some(ServiceStatus {
            conditions: vec![Condition::new("Ready", ConditionStatus::True)],
            ..Default::default()
        });
        service
    }

    fn chrono_now() -> k8s_openapi::chrono::DateTime<k8s_openapi::chrono::Utc> {
        k8s_openapi::chrono::Utc::now()
    }

    #[test]
    fn test_canonical_strips_server_fields() {
        let value = canonical_value(&server_side_service()).unwrap();
        assert!(value.get("status").is_none());

        let meta = &value["metadata"];
        assert_eq!(meta["name"], "foo");
        assert_eq!(meta["namespace"], "default");
        for field in ["resourceVersion", "uid", "generation", "creationTimestamp"] {
            assert!(meta.get(field).is_none(), "{field}");
        }

        let template = &value["spec"]["template"];
        assert!(template.get("metadata").is_none());
        let container = &template["spec"]["containers"][0];
        assert_eq!(container["image"], "gcr.io/foo/bar:baz");
        assert!(container.get("name").is_none());
        assert!(container.get("resources").is_none());
    }

    #[test]
    fn test_canonical_is_stable_across_server_roundtrip() {
        let authored = Service::with_image("foo", "default", "gcr.io/foo/bar:baz");
        assert_eq!(
            canonical_json(&authored).unwrap(),
            canonical_json(&server_side_service()).unwrap()
        );
    }

    #[test]
    fn test_annotate_last_applied_excludes_itself() {
        let mut service = Service::with_image("foo", "default", "img");
        annotate_last_applied(&mut service).unwrap();
        let first = last_applied(&service).unwrap().unwrap();
        assert!(first["metadata"].get("annotations").is_none());

        // re-annotating yields the same baseline
        annotate_last_applied(&mut service).unwrap();
        assert_eq!(last_applied(&service).unwrap().unwrap(), first);
    }

    #[test]
    fn test_last_applied_absent() {
        let service = Service::with_image("foo", "default", "img");
        assert!(last_applied(&service).is_none());
    }
}
