//! Portable export documents
//!
//! An [`Export`] bundles a service with the prior revisions its routing
//! still references, stripped of everything tied to the source cluster, so
//! the pair can be recreated elsewhere by import.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::annotations::{client, serving};
use crate::canonical::{prune_metadata, strip_empty_pod_fields, strip_server_metadata};
use crate::error::{CoreError, Result};
use crate::resources::{Revision, Service};

/// API version of the export document
pub const EXPORT_API_VERSION: &str = "client.knative.dev/v1alpha1";

/// Kind of the export document
pub const EXPORT_KIND: &str = "Export";

/// Labels tied to the source cluster's object identities
const IDENTITY_LABELS: &[&str] = &[
    serving::SERVICE_UID_LABEL,
    "serving.knative.dev/configurationUID",
    "serving.knative.dev/routingState",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Export {
    pub api_version: String,
    pub kind: String,
    pub spec: ExportSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSpec {
    pub service: Service,

    /// Prior revisions, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub revisions: Vec<Revision>,
}

impl Export {
    /// Build an export from a live service and its revisions
    ///
    /// Only revisions referenced by the routing table or created last are
    /// kept; the one matching the current template is left out since the
    /// service recreates it.
    pub fn new(service: &Service, revisions: &[Revision]) -> Self {
        let mut referenced: BTreeSet<&str> = service
            .effective_traffic()
            .iter()
            .filter_map(|t| t.revision_name.as_deref())
            .collect();
        let latest = service.latest_created_revision();
        if let Some(latest) = latest {
            referenced.insert(latest);
        }

        let mut selected: Vec<Revision> = revisions
            .iter()
            .filter(|r| {
                r.metadata
                    .name
                    .as_deref()
                    .is_some_and(|n| referenced.contains(n))
            })
            .cloned()
            .collect();
        sort_revisions(&mut selected);

        let current = service.spec.template.metadata.name.as_deref().or(latest);
        let revisions = selected
            .into_iter()
            .filter(|r| r.metadata.name.as_deref() != current)
            .map(strip_revision)
            .collect();

        let mut service = strip_service(service.clone());
        if service.spec.template.metadata.name.is_none()
            && let Some(latest) = latest
        {
            service.spec.template.metadata.name = Some(latest.to_string());
        }

        Self {
            api_version: EXPORT_API_VERSION.to_string(),
            kind: EXPORT_KIND.to_string(),
            spec: ExportSpec { service, revisions },
        }
    }

    /// Parse an export from YAML or JSON
    ///
    /// A bare service document is accepted as an export without revisions.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(text)?;
        let export = match value.get("kind").and_then(Value::as_str) {
            Some(EXPORT_KIND) => serde_json::from_value::<Export>(value)?,
            Some("Service") => Export {
                api_version: EXPORT_API_VERSION.to_string(),
                kind: EXPORT_KIND.to_string(),
                spec: ExportSpec {
                    service: serde_json::from_value(value)?,
                    revisions: Vec::new(),
                },
            },
            other => {
                return Err(CoreError::InvalidExport {
                    message: format!(
                        "expected kind {EXPORT_KIND} or Service, got {}",
                        other.unwrap_or("nothing")
                    ),
                });
            }
        };
        export.validate()?;
        Ok(export)
    }

    /// Check the document can be imported
    pub fn validate(&self) -> Result<()> {
        match self.spec.service.metadata.name.as_deref() {
            Some(name) if !name.is_empty() => {}
            _ => {
                return Err(CoreError::InvalidExport {
                    message: "service has no name".to_string(),
                });
            }
        }
        if let Some(index) = self
            .spec
            .revisions
            .iter()
            .position(|r| r.metadata.name.as_deref().is_none_or(str::is_empty))
        {
            return Err(CoreError::InvalidExport {
                message: format!("revision #{index} has no name"),
            });
        }
        Ok(())
    }

    /// Name of the exported service
    pub fn service_name(&self) -> &str {
        self.spec.service.metadata.name.as_deref().unwrap_or_default()
    }

    /// Serializable form with empty container fields removed
    pub fn to_value(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Some(template_spec) = value.pointer_mut("/spec/service/spec/template/spec") {
            strip_empty_pod_fields(template_spec);
        }
        if let Some(revisions) = value
            .pointer_mut("/spec/revisions")
            .and_then(Value::as_array_mut)
        {
            for revision in revisions {
                if let Some(spec) = revision.get_mut("spec") {
                    strip_empty_pod_fields(spec);
                }
            }
        }
        Ok(value)
    }
}

/// Service without status, namespace and server-owned metadata
pub fn service_to_value(service: &Service) -> Result<Value> {
    let mut value = serde_json::to_value(strip_service(service.clone()))?;
    if let Some(object) = value.as_object_mut() {
        if let Some(meta) = object.get_mut("metadata") {
            strip_server_metadata(meta);
        }
        prune_metadata(object);
    }
    if let Some(spec) = value.pointer_mut("/spec/template/spec") {
        strip_empty_pod_fields(spec);
    }
    Ok(value)
}

/// Order revisions by configuration generation, then name
pub fn sort_revisions(revisions: &mut [Revision]) {
    revisions.sort_by(|a, b| {
        (a.configuration_generation(), a.metadata.name.as_deref())
            .cmp(&(b.configuration_generation(), b.metadata.name.as_deref()))
    });
}

fn strip_service(mut service: Service) -> Service {
    service.status = None;
    clear_cluster_metadata(&mut service.metadata);
    if let Some(annotations) = service.metadata.annotations.as_mut() {
        annotations.remove(client::LAST_APPLIED);
        annotations.remove(serving::CREATOR);
        annotations.remove(serving::LAST_MODIFIER);
    }
    service.metadata.annotations = service.metadata.annotations.filter(|a| !a.is_empty());
    service.spec.template.metadata.creation_timestamp = None;
    service
}

fn strip_revision(mut revision: Revision) -> Revision {
    revision.status = None;
    clear_cluster_metadata(&mut revision.metadata);
    revision.metadata.owner_references = None;
    if let Some(labels) = revision.metadata.labels.as_mut() {
        for label in IDENTITY_LABELS {
            labels.remove(*label);
        }
    }
    if let Some(annotations) = revision.metadata.annotations.as_mut() {
        annotations.remove("serving.knative.dev/routingStateModified");
        annotations.remove(serving::CREATOR);
    }
    revision
}

fn clear_cluster_metadata(meta: &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) {
    meta.namespace = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.resource_version = None;
    meta.uid = None;
    meta.generation = None;
    meta.managed_fields = None;
    meta.self_link = None;
}
