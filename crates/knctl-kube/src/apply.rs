//! Three-way merge apply
//!
//! The desired service is compared against the live object using the
//! last-applied annotation as the common ancestor:
//! - fields dropped since the last apply are deleted
//! - fields the user changed are overwritten
//! - fields only the server knows about (admission defaults, other tools)
//!   are left alone
//!
//! The result is submitted as a JSON merge patch. Strategic merge metadata is
//! not published for custom resources, so it is never used here.

use std::time::Duration;

use knctl_core::annotations::client;
use knctl_core::canonical::{canonical_json, canonical_value, last_applied, strip_empty_pod_fields};
use knctl_core::merge::{is_empty_patch, three_way_merge};
use knctl_core::resources::{Conditioned, Service};
use serde_json::Value;

use crate::error::{KubeError, Result};
use crate::gateway::{PatchStrategy, ServingGateway};

/// Patch attempts before a conflict is reported
pub const APPLY_ATTEMPTS: u32 = 5;

/// Pause between conflicting attempts
pub const APPLY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What an apply did
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The service did not exist and was created
    Created(Service),
    /// A patch was submitted; `changed` when the server accepted a new generation
    Applied { service: Service, changed: bool },
    /// The computed patch was empty
    NoChanges(Service),
}

impl ApplyOutcome {
    pub fn service(&self) -> &Service {
        match self {
            ApplyOutcome::Created(service)
            | ApplyOutcome::Applied { service, .. }
            | ApplyOutcome::NoChanges(service) => service,
        }
    }

    /// Whether the server now converges toward a new generation
    pub fn needs_wait(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Created(_) | ApplyOutcome::Applied { changed: true, .. }
        )
    }
}

/// Desired service annotated with its own canonical form
pub fn with_last_applied(desired: &Service) -> Result<Service> {
    let mut annotated = desired.clone();
    knctl_core::canonical::annotate_last_applied(&mut annotated)?;
    Ok(annotated)
}

/// The "modified" side of the merge: canonical form plus the annotation
fn modified_value(desired: &Service) -> Result<Value> {
    let mut value = canonical_value(desired)?;
    let json = canonical_json(desired)?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| KubeError::Serialization("service is not an object".to_string()))?;
    let annotations = object
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()))
        .as_object_mut()
        .ok_or_else(|| KubeError::Serialization("metadata is not an object".to_string()))?
        .entry("annotations")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(annotations) = annotations.as_object_mut() {
        annotations.insert(client::LAST_APPLIED.to_string(), Value::String(json));
    }
    Ok(value)
}

/// The "current" side of the merge, normalized like the canonical form
fn current_value(current: &Service) -> Result<Value> {
    let mut value = serde_json::to_value(current)?;
    if let Some(spec) = value.pointer_mut("/spec/template/spec") {
        strip_empty_pod_fields(spec);
    }
    Ok(value)
}

/// Original recorded on the live object, if readable
fn original_value(current: &Service) -> Option<Value> {
    match last_applied(current)? {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unreadable last-applied annotation");
            None
        }
    }
}

/// Compute the merge patch turning `current` into `desired`
pub fn compute_patch(desired: &Service, current: &Service) -> Result<Value> {
    let original = original_value(current);
    let modified = modified_value(desired)?;
    let current = current_value(current)?;
    Ok(three_way_merge(original.as_ref(), &modified, &current))
}

/// Apply a desired service through `gateway`
///
/// A missing service is created. Otherwise a merge patch is computed and
/// submitted; on conflict the live object is re-read and the patch
/// recomputed, up to [`APPLY_ATTEMPTS`] times.
pub async fn apply_service<G>(gateway: &G, desired: &Service) -> Result<ApplyOutcome>
where
    G: ServingGateway + ?Sized,
{
    let name = desired.metadata.name.clone().unwrap_or_default();

    for attempt in 1..=APPLY_ATTEMPTS {
        let current = match gateway.get_service(&name).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => {
                tracing::info!(%name, "service not found, creating");
                let created = gateway.create_service(&with_last_applied(desired)?).await?;
                return Ok(ApplyOutcome::Created(created));
            }
            Err(e) => return Err(e),
        };

        if last_applied(&current).is_none() {
            tracing::debug!(%name, "no usable last-applied annotation, two-way merge");
        }
        let patch = compute_patch(desired, &current)?;
        if is_empty_patch(&patch) {
            return Ok(ApplyOutcome::NoChanges(current));
        }
        tracing::debug!(%name, %patch, "submitting merge patch");

        match gateway
            .patch_service(&name, PatchStrategy::Merge, &patch)
            .await
        {
            Ok(service) => {
                let changed = service.status.is_none() || !service.is_generation_observed();
                return Ok(ApplyOutcome::Applied { service, changed });
            }
            Err(e) if e.is_conflict() => {
                tracing::warn!(%name, attempt, "conflict while applying, retrying");
                if attempt < APPLY_ATTEMPTS {
                    tokio::time::sleep(APPLY_RETRY_DELAY).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(KubeError::RetriesExhausted {
        operation: "apply".to_string(),
        name,
        attempts: APPLY_ATTEMPTS,
    })
}
