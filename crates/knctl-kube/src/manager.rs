//! Service lifecycle coordinator
//!
//! [`ServiceManager`] runs one user command against a [`ServingGateway`]:
//! it builds the desired service from a validated edit, picks the right
//! write (create, update, patch or force-replace), retries conflicts within
//! fixed bounds and waits for readiness when asked.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use knctl_core::annotations::{self, serving};
use knctl_core::canonical::{annotate_last_applied, last_applied};
use knctl_core::export::sort_revisions;
use knctl_core::resources::{SERVING_API_VERSION, label};
use knctl_core::traffic;
use knctl_core::{
    CoreError, EditMode, Export, Revision, Service, ServiceEdit, TrafficTarget,
    pin_image_to_digest,
};

use crate::actions::{
    ApplyOptions, CONFLICT_RETRY_DELAY, CreateOptions, DeleteOptions, ImportOptions,
    MigrateOptions, REPLACE_ATTEMPTS, UpdateOptions,
};
use crate::apply::{ApplyOutcome, apply_service};
use crate::error::{KubeError, Result};
use crate::gateway::{ListFilter, ServingGateway};
use crate::progress::ProgressReporter;
use crate::wait::WaitConfig;

/// Attempts to read a configuration the server has not created yet
const CONFIGURATION_ATTEMPTS: u32 = 10;

const CONFIGURATION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A revision as shown by describe
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionSummary {
    pub revision: Revision,
    /// Share of live traffic
    pub percent: i64,
    /// Tags routed to this revision
    pub tags: Vec<String>,
    /// Routed through the latest-revision target
    pub latest: bool,
}

/// Service plus the revisions its routing references
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDescription {
    pub service: Service,
    pub revisions: Vec<RevisionSummary>,
}

/// Result of a namespace migration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrateSummary {
    /// Services copied, in order
    pub migrated: Vec<String>,
    /// Revisions recreated at the destination
    pub revisions: usize,
}

/// Coordinator of service commands
pub struct ServiceManager<G: ServingGateway + ?Sized> {
    gateway: Arc<G>,
    progress: ProgressReporter,
}

impl<G: ServingGateway + ?Sized> ServiceManager<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self {
            gateway,
            progress: ProgressReporter::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    fn namespace(&self) -> &str {
        self.gateway.namespace()
    }

    /// Empty service in the gateway's namespace
    fn new_service(&self, name: &str) -> Service {
        let mut service = Service::new(name, Default::default());
        service.metadata.namespace = Some(self.namespace().to_string());
        service
    }

    /// Service constructed from an edit, as create and apply send it
    fn desired_service(&self, name: &str, edit: &ServiceEdit, mode: EditMode) -> Result<Service> {
        edit.require_image()?;
        let mut service = self.new_service(name);
        edit.apply_to(&mut service, mode)?;
        if !edit.traffic().is_empty() {
            service.spec.traffic =
                traffic::resolve(&[], edit.traffic(), true).map_err(CoreError::from)?;
        }
        Ok(service)
    }

    // ========== Create ==========

    /// Create a service, or replace it when forced
    pub async fn create(
        &self,
        name: &str,
        edit: &ServiceEdit,
        options: &CreateOptions,
    ) -> Result<Service> {
        let mut desired = self.desired_service(name, edit, EditMode::Create)?;
        annotate_last_applied(&mut desired)?;

        let (service, action) = match self.gateway.get_service(name).await {
            Ok(existing) => {
                if !options.force {
                    return Err(KubeError::AlreadyExists {
                        kind: "service".to_string(),
                        name: name.to_string(),
                    });
                }
                self.progress
                    .start("Replacing", "service", name, self.namespace());
                (self.replace(existing, desired).await?, "replaced")
            }
            Err(e) if e.is_not_found() => {
                self.progress
                    .start("Creating", "service", name, self.namespace());
                tracing::info!(%name, namespace = %self.namespace(), "creating service");
                (self.gateway.create_service(&desired).await?, "created")
            }
            Err(e) => return Err(e),
        };

        self.finish(name, action, service, options.wait.as_ref())
            .await
    }

    /// Overwrite an existing service, keeping its ownership annotations
    async fn replace(&self, mut existing: Service, desired: Service) -> Result<Service> {
        let name = desired.metadata.name.clone().unwrap_or_default();
        for attempt in 1..=REPLACE_ATTEMPTS {
            let mut replacement = desired.clone();
            let kept: BTreeMap<String, String> = existing
                .metadata
                .annotations
                .iter()
                .flatten()
                .filter(|(k, _)| {
                    k.as_str() == serving::CREATOR || k.as_str() == serving::LAST_MODIFIER
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            if !kept.is_empty() {
                replacement
                    .metadata
                    .annotations
                    .get_or_insert_with(Default::default)
                    .extend(kept);
            }
            replacement.metadata.resource_version = existing.metadata.resource_version.clone();

            match self.gateway.update_service(&replacement).await {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() => {
                    tracing::warn!(%name, attempt, "conflict while replacing, retrying");
                    if attempt < REPLACE_ATTEMPTS {
                        tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
                        existing = self.gateway.get_service(&name).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(KubeError::RetriesExhausted {
            operation: "replace".to_string(),
            name,
            attempts: REPLACE_ATTEMPTS,
        })
    }

    // ========== Update ==========

    /// Update a service from an edit
    pub async fn update(
        &self,
        name: &str,
        edit: &ServiceEdit,
        options: &UpdateOptions,
    ) -> Result<Service> {
        let base = if edit.lock_to_digest() && edit.image().is_none() {
            self.base_revision(name).await?
        } else {
            None
        };

        self.progress
            .start("Updating", "service", name, self.namespace());
        let updated = self
            .update_with_retry(name, options.max_attempts, |mut service| {
                let changed = edit.apply_to(&mut service, EditMode::Update)?;
                if changed && let Some(base) = &base && pin_image_to_digest(&mut service, base) {
                    tracing::debug!(%name, "pinned image to the base revision's digest");
                }
                if !edit.traffic().is_empty() {
                    service.spec.traffic =
                        traffic::resolve(&service.spec.traffic, edit.traffic(), false)
                            .map_err(CoreError::from)?;
                }
                Ok(service)
            })
            .await?;

        self.finish(name, "updated", updated, options.wait.as_ref())
            .await
    }

    /// Read-modify-write loop, re-reading on conflict
    ///
    /// `update_fn` receives the freshly read service each attempt. After
    /// `max_attempts` conflicting writes the error names the attempt count.
    pub async fn update_with_retry<F>(
        &self,
        name: &str,
        max_attempts: u32,
        mut update_fn: F,
    ) -> Result<Service>
    where
        F: FnMut(Service) -> Result<Service> + Send,
    {
        let max_attempts = max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let current = self.gateway.get_service(name).await?;
            if current.is_terminating() {
                return Err(KubeError::Terminating {
                    kind: "service".to_string(),
                    name: name.to_string(),
                });
            }

            let updated = update_fn(current)?;
            match self.gateway.update_service(&updated).await {
                Ok(service) => return Ok(service),
                Err(e) if e.is_conflict() => {
                    tracing::warn!(%name, attempt, max_attempts, "conflict while updating, retrying");
                    if attempt < max_attempts {
                        tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(KubeError::RetriesExhausted {
            operation: "update".to_string(),
            name: name.to_string(),
            attempts: max_attempts,
        })
    }

    /// Revision the current template was stamped into, if it still exists
    async fn base_revision(&self, name: &str) -> Result<Option<Revision>> {
        let service = self.gateway.get_service(name).await?;
        let Some(revision_name) = service
            .spec
            .template
            .metadata
            .name
            .as_deref()
            .or(service.latest_created_revision())
        else {
            return Ok(None);
        };
        match self.gateway.get_revision(revision_name).await {
            Ok(revision) => Ok(Some(revision)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ========== Apply ==========

    /// Declaratively apply an edit as the full desired service
    pub async fn apply(
        &self,
        name: &str,
        edit: &ServiceEdit,
        options: &ApplyOptions,
    ) -> Result<ApplyOutcome> {
        let desired = self.desired_service(name, edit, EditMode::Apply)?;

        match self.gateway.get_service(name).await {
            Ok(current) if last_applied(&current).is_none() => {
                tracing::warn!(%name, "service has no last-applied annotation");
                self.progress.warn(&format!(
                    "service '{name}' was not created by apply; fields set by other means may be overwritten"
                ));
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let outcome = apply_service(self.gateway.as_ref(), &desired).await?;
        if matches!(outcome, ApplyOutcome::NoChanges(_)) {
            self.progress
                .line(format!("No changes to apply to service '{name}'."));
            return Ok(outcome);
        }

        let (verb, action) = match &outcome {
            ApplyOutcome::Created(_) => ("Creating", "created"),
            _ => ("Applying", "applied"),
        };
        self.progress.start(verb, "service", name, self.namespace());
        let wait = options.wait.as_ref().filter(|_| outcome.needs_wait());
        let service = self
            .finish(name, action, outcome.service().clone(), wait)
            .await?;
        Ok(match outcome {
            ApplyOutcome::Applied { changed, .. } => ApplyOutcome::Applied { service, changed },
            _ => ApplyOutcome::Created(service),
        })
    }

    // ========== Delete ==========

    pub async fn delete(&self, name: &str, options: &DeleteOptions) -> Result<()> {
        match options.wait {
            Some(timeout) if !timeout.is_zero() => {
                self.gateway.delete_service_and_wait(name, timeout).await?
            }
            _ => self.gateway.delete_service(name, Duration::ZERO).await?,
        }
        tracing::info!(%name, "service deleted");
        self.progress.line(format!(
            "Service '{name}' successfully deleted in namespace '{}'.",
            self.namespace()
        ));
        Ok(())
    }

    // ========== Read ==========

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Service>> {
        self.gateway.list_services(filter).await
    }

    /// Service with its routed revisions, newest first
    pub async fn describe(&self, name: &str) -> Result<ServiceDescription> {
        let service = self.gateway.get_service(name).await?;
        let mut revisions = self
            .gateway
            .list_revisions(&ListFilter::new().with_service(name))
            .await?;
        sort_revisions(&mut revisions);
        revisions.reverse();

        let traffic = service.effective_traffic();
        let latest_ready = service.latest_ready_revision();
        let revisions = revisions
            .into_iter()
            .filter_map(|revision| {
                let revision_name = revision.metadata.name.clone()?;
                let routed: Vec<&TrafficTarget> = traffic
                    .iter()
                    .filter(|t| {
                        t.revision_name.as_deref() == Some(&revision_name)
                            || (t.is_latest()
                                && t.revision_name.is_none()
                                && latest_ready == Some(revision_name.as_str()))
                    })
                    .collect();
                let is_latest_created =
                    service.latest_created_revision() == Some(revision_name.as_str());
                if routed.is_empty() && !is_latest_created {
                    return None;
                }
                Some(RevisionSummary {
                    percent: routed.iter().map(|t| t.percent_or_zero()).sum(),
                    tags: routed.iter().filter_map(|t| t.tag.clone()).collect(),
                    latest: routed.iter().any(|t| t.is_latest()),
                    revision,
                })
            })
            .collect();

        Ok(ServiceDescription { service, revisions })
    }

    // ========== Export / Import ==========

    /// Export a service, with its routed revisions when asked
    pub async fn export(&self, name: &str, with_revisions: bool) -> Result<Export> {
        let service = self.gateway.get_service(name).await?;
        let revisions = if with_revisions {
            self.gateway
                .list_revisions(&ListFilter::new().with_service(name))
                .await?
        } else {
            Vec::new()
        };
        Ok(Export::new(&service, &revisions))
    }

    /// Recreate an exported service and its prior revisions
    pub async fn import(&self, export: &Export, options: &ImportOptions) -> Result<Service> {
        export.validate()?;
        let name = export.service_name().to_string();
        if self.gateway.service_exists(&name).await? {
            return Err(KubeError::AlreadyExists {
                kind: "service".to_string(),
                name,
            });
        }

        self.progress
            .start("Importing", "service", &name, self.namespace());
        let mut service = export.spec.service.clone();
        reset_for_copy(&mut service.metadata, self.namespace());
        service.status = None;
        let created = self.gateway.create_service(&service).await?;

        if !export.spec.revisions.is_empty() {
            let owner = self.configuration_owner(&name).await?;
            for revision in &export.spec.revisions {
                self.gateway
                    .create_revision(&self.adopt_revision(revision, &name, &owner))
                    .await?;
            }
            tracing::info!(%name, count = export.spec.revisions.len(), "imported revisions");
        }

        self.finish(&name, "imported", created, options.wait.as_ref())
            .await
    }

    /// Owner reference to the service's configuration, once the server made it
    async fn configuration_owner(&self, name: &str) -> Result<OwnerReference> {
        let mut attempt = 1;
        let configuration = loop {
            match self.gateway.get_configuration(name).await {
                Ok(configuration) => break configuration,
                Err(e) if e.is_not_found() && attempt < CONFIGURATION_ATTEMPTS => {
                    tracing::debug!(%name, attempt, "configuration not created yet");
                    attempt += 1;
                    tokio::time::sleep(CONFIGURATION_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        };
        Ok(OwnerReference {
            api_version: SERVING_API_VERSION.to_string(),
            kind: "Configuration".to_string(),
            name: name.to_string(),
            uid: configuration.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }

    /// Copy of a revision owned by `owner` in this namespace
    fn adopt_revision(&self, revision: &Revision, service: &str, owner: &OwnerReference) -> Revision {
        let mut adopted = revision.clone();
        reset_for_copy(&mut adopted.metadata, self.namespace());
        adopted.status = None;
        adopted.metadata.owner_references = Some(vec![owner.clone()]);
        let labels = adopted.metadata.labels.get_or_insert_with(Default::default);
        labels.insert(serving::SERVICE_LABEL.to_string(), service.to_string());
        labels.insert(serving::CONFIGURATION_LABEL.to_string(), service.to_string());
        adopted
    }

    // ========== Migrate ==========

    /// Copy every service of `source`'s namespace into this gateway's
    pub async fn migrate<S>(&self, source: &S, options: &MigrateOptions) -> Result<MigrateSummary>
    where
        S: ServingGateway + ?Sized,
    {
        let mut summary = MigrateSummary::default();
        let services = source.list_services(&ListFilter::new()).await?;
        if services.is_empty() {
            self.progress.line(format!(
                "No services found in namespace '{}'.",
                source.namespace()
            ));
            return Ok(summary);
        }

        for source_service in services {
            let name = source_service.metadata.name.clone().unwrap_or_default();
            if self.gateway.service_exists(&name).await? {
                if !options.force {
                    return Err(KubeError::AlreadyExists {
                        kind: "service".to_string(),
                        name,
                    });
                }
                tracing::info!(%name, "replacing service at destination");
                self.gateway
                    .delete_service_and_wait(&name, options.delete_timeout)
                    .await?;
            }

            self.progress
                .start("Migrating", "service", &name, self.namespace());
            let mut service = source_service.clone();
            reset_for_copy(&mut service.metadata, self.namespace());
            service.status = None;
            if service.spec.template.metadata.name.is_none() {
                service.spec.template.metadata.name =
                    source_service.latest_ready_revision().map(str::to_string);
            }
            self.gateway.create_service(&service).await?;

            let mut revisions = source
                .list_revisions(&ListFilter::new().with_service(&name))
                .await?;
            sort_revisions(&mut revisions);
            if !revisions.is_empty() {
                let owner = self.configuration_owner(&name).await?;
                for revision in &revisions {
                    summary.revisions += self
                        .migrate_revision(&source_service, revision, &owner)
                        .await?;
                }
            }

            if let Some(config) = &options.wait {
                self.wait_ready(&name, config).await?;
            }
            if options.delete_source {
                source.delete_service(&name, Duration::ZERO).await?;
                tracing::info!(%name, namespace = %source.namespace(), "deleted source service");
            }
            self.progress.line(format!(
                "Service '{name}' migrated to namespace '{}'.",
                self.namespace()
            ));
            summary.migrated.push(name);
        }
        Ok(summary)
    }

    /// Recreate one source revision at the destination
    ///
    /// The source's latest ready revision is recreated by the destination
    /// server from the template, so only its generation label is carried over.
    // TODO: confirm the generation label copy against a live control plane;
    // the server may rewrite it on the next reconcile.
    async fn migrate_revision(
        &self,
        source_service: &Service,
        revision: &Revision,
        owner: &OwnerReference,
    ) -> Result<usize> {
        let service = source_service.metadata.name.as_deref().unwrap_or_default();
        let revision_name = revision.metadata.name.as_deref().unwrap_or_default();

        if Some(revision_name) == source_service.latest_ready_revision() {
            let Some(generation) =
                label(&revision.metadata, serving::CONFIGURATION_GENERATION_LABEL)
            else {
                return Ok(0);
            };
            let mut existing = match self.gateway.get_revision(revision_name).await {
                Ok(existing) => existing,
                Err(e) if e.is_not_found() => return Ok(0),
                Err(e) => return Err(e),
            };
            existing
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(
                    serving::CONFIGURATION_GENERATION_LABEL.to_string(),
                    generation.to_string(),
                );
            self.gateway.update_revision(&existing).await?;
            return Ok(0);
        }

        self.gateway
            .create_revision(&self.adopt_revision(revision, service, owner))
            .await?;
        Ok(1)
    }

    // ========== Waiting ==========

    /// Wait for readiness, reporting condition messages as they change
    pub async fn wait_ready(&self, name: &str, config: &WaitConfig) -> Result<()> {
        let started = Instant::now();
        let progress = self.progress.clone();
        let on_message = move |message: &str| progress.waiting(started.elapsed(), message);
        let outcome = self
            .gateway
            .wait_for_service(name, config, &on_message)
            .await?;
        outcome.into_result(name, config.timeout)?;
        self.progress.ready(started.elapsed());
        Ok(())
    }

    /// Optionally wait, then print the closing line with the URL
    async fn finish(
        &self,
        name: &str,
        action: &str,
        written: Service,
        wait: Option<&WaitConfig>,
    ) -> Result<Service> {
        let Some(config) = wait else {
            self.progress.service_url(name, action, None, None);
            return Ok(written);
        };
        self.wait_ready(name, config).await?;
        let service = self.gateway.get_service(name).await?;
        self.progress.service_url(
            name,
            action,
            service.latest_ready_revision(),
            service.url(),
        );
        Ok(service)
    }
}

/// Clear identity metadata so an object can be created elsewhere
fn reset_for_copy(meta: &mut ObjectMeta, namespace: &str) {
    meta.namespace = Some(namespace.to_string());
    meta.uid = None;
    meta.resource_version = None;
    meta.generation = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.managed_fields = None;
    meta.owner_references = None;
    meta.self_link = None;
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(annotations::client::LAST_APPLIED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MockGateway, ScriptedError};
    use crate::wait::WaitOutcome;
    use k8s_openapi::api::core::v1::EnvVar;
    use knctl_core::EditFlags;
    use knctl_core::resources::Conditioned;
    use std::sync::Mutex;

    fn setup(mock: &MockGateway) -> (ServiceManager<MockGateway>, Arc<Mutex<String>>) {
        let (progress, output) = ProgressReporter::buffered();
        (
            ServiceManager::new(Arc::new(mock.clone())).with_progress(progress),
            output,
        )
    }

    fn edit(configure: impl FnOnce(&mut EditFlags)) -> ServiceEdit {
        let mut flags = EditFlags::default();
        configure(&mut flags);
        flags.parse().unwrap()
    }

    fn image(image: &str) -> ServiceEdit {
        edit(|f| f.image = vec![image.to_string()])
    }

    fn wait() -> WaitConfig {
        WaitConfig::new(Duration::from_secs(60))
    }

    fn env(service: &Service) -> Vec<(String, String)> {
        service
            .first_container()
            .and_then(|c| c.env.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|e| (e.name, e.value.unwrap_or_default()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_rpc_sequence_and_output() {
        let mock = MockGateway::new("default");
        let (manager, output) = setup(&mock);

        let service = manager
            .create(
                "foo",
                &image("gcr.io/foo/bar:baz"),
                &CreateOptions::new().with_wait(wait()),
            )
            .await
            .unwrap();

        assert_eq!(
            mock.calls(),
            vec![
                "GetService(foo)",
                "CreateService(foo)",
                "WaitForService(foo)",
                "GetService(foo)"
            ]
        );
        assert_eq!(service.url(), Some("http://foo.example.com"));
        let out = output.lock().unwrap().clone();
        assert!(out.contains("Creating"));
        assert!(out.contains("foo"));
        assert!(out.contains("http://foo.example.com"));
        assert!(out.contains("Ready"));
    }

    #[tokio::test]
    async fn test_create_existing_without_force_fails() {
        let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
        let (manager, _) = setup(&mock);

        let err = manager
            .create("foo", &image("img:2"), &CreateOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::AlreadyExists { .. }));
        assert_eq!(mock.calls(), vec!["GetService(foo)"]);
    }

    #[tokio::test]
    async fn test_create_requires_image() {
        let mock = MockGateway::new("default");
        let (manager, _) = setup(&mock);
        let err = manager
            .create("foo", &edit(|_| {}), &CreateOptions::new())
            .await
            .unwrap_err();
        assert!(err.is_user_input());
        assert!(mock.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_replace() {
        let mut existing = Service::with_image("foo", "default", "gcr.io/foo/bar:v1");
        existing.metadata.annotations = Some(BTreeMap::from([
            (serving::CREATOR.to_string(), "alice".to_string()),
            (serving::LAST_MODIFIER.to_string(), "bob".to_string()),
        ]));
        let mock = MockGateway::with_services("default", vec![existing]);
        let version_before = mock.service("foo").unwrap().metadata.resource_version;
        mock.fail_next("UpdateService", ScriptedError::Conflict);
        let (manager, _) = setup(&mock);

        let replaced = manager
            .create(
                "foo",
                &image("gcr.io/foo/bar:v2"),
                &CreateOptions::new().with_force(),
            )
            .await
            .unwrap();

        assert_eq!(replaced.image(), Some("gcr.io/foo/bar:v2"));
        assert_ne!(replaced.metadata.resource_version, version_before);
        let annotations = replaced.metadata.annotations.unwrap();
        assert_eq!(annotations[serving::CREATOR], "alice");
        assert_eq!(annotations[serving::LAST_MODIFIER], "bob");
        assert_eq!(
            mock.calls(),
            vec![
                "GetService(foo)",
                "UpdateService(foo)",
                "GetService(foo)",
                "UpdateService(foo)"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_replace_gives_up_after_three_conflicts() {
        let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
        mock.fail_times("UpdateService", ScriptedError::Conflict, 3);
        let (manager, _) = setup(&mock);

        let err = manager
            .create("foo", &image("img:2"), &CreateOptions::new().with_force())
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_apply_unchanged_reports_no_changes() {
        let mock = MockGateway::new("default");
        let (manager, output) = setup(&mock);
        let edit = image("gcr.io/foo/bar:baz");

        let first = manager.apply("foo", &edit, &ApplyOptions::new()).await.unwrap();
        assert!(matches!(first, ApplyOutcome::Created(_)));

        let second = manager.apply("foo", &edit, &ApplyOptions::new()).await.unwrap();
        assert!(matches!(second, ApplyOutcome::NoChanges(_)));
        assert!(output.lock().unwrap().contains("No changes to apply"));
    }

    #[tokio::test]
    async fn test_apply_warns_without_annotation() {
        let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
        let (manager, output) = setup(&mock);

        manager
            .apply("foo", &image("img:2"), &ApplyOptions::new().with_wait(wait()))
            .await
            .unwrap();
        assert!(output.lock().unwrap().contains("Warning:"));
        assert!(mock.calls().contains(&"WaitForService(foo)".to_string()));
    }

    #[tokio::test]
    async fn test_update_env_add_and_remove() {
        let mut initial = Service::with_image("foo", "default", "img");
        initial.first_container_mut().env = Some(vec![
            EnvVar { name: "A".into(), value: Some("mouse".into()), ..Default::default() },
            EnvVar { name: "B".into(), value: Some("cookie".into()), ..Default::default() },
            EnvVar { name: "empty".into(), value: Some(String::new()), ..Default::default() },
        ]);
        let mock = MockGateway::with_services("default", vec![initial]);
        let (manager, _) = setup(&mock);

        let updated = manager
            .update(
                "foo",
                &edit(|f| f.env = vec!["A=rabbit".into(), "empty-".into()]),
                &UpdateOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            env(&updated),
            vec![
                ("A".to_string(), "rabbit".to_string()),
                ("B".to_string(), "cookie".to_string())
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_conflict_bound_is_configurable() {
        for attempts in [1_u32, 4] {
            let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
            mock.fail_times("UpdateService", ScriptedError::Conflict, 10);
            let (manager, _) = setup(&mock);

            let err = manager
                .update_with_retry("foo", attempts, Ok)
                .await
                .unwrap_err();
            assert!(err.to_string().contains(&format!("{attempts} attempts")));
            let updates = mock
                .calls()
                .iter()
                .filter(|c| c.starts_with("UpdateService"))
                .count();
            assert_eq!(updates, attempts as usize);
        }
    }

    #[tokio::test]
    async fn test_update_refuses_terminating_service() {
        let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
        let mut terminating = mock.service("foo").unwrap();
        terminating.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(k8s_openapi::chrono::Utc::now()),
        );
        mock.put_service(terminating);
        let (manager, _) = setup(&mock);

        let err = manager
            .update("foo", &image("img:2"), &UpdateOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::Terminating { .. }));
    }

    #[tokio::test]
    async fn test_update_traffic_split() {
        let mut initial = Service::with_image("foo", "default", "img");
        initial.spec.traffic = vec![TrafficTarget::revision("r1", 100)];
        let mock = MockGateway::with_services("default", vec![initial]);
        let (manager, _) = setup(&mock);

        let updated = manager
            .update(
                "foo",
                &edit(|f| {
                    f.traffic.tags = vec!["r1=stable".into(), "@latest=canary".into()];
                    f.traffic.traffic = vec!["stable=80,canary=20".into()];
                }),
                &UpdateOptions::new(),
            )
            .await
            .unwrap();

        let traffic = &updated.spec.traffic;
        assert_eq!(traffic.len(), 2);
        assert_eq!(traffic.iter().map(|t| t.percent_or_zero()).sum::<i64>(), 100);
        let canary = traffic.iter().find(|t| t.tag.as_deref() == Some("canary")).unwrap();
        assert!(canary.is_latest());
        assert_eq!(canary.percent, Some(20));
        let stable = traffic.iter().find(|t| t.tag.as_deref() == Some("stable")).unwrap();
        assert!(!stable.is_latest());
        assert_eq!(stable.percent, Some(80));
    }

    #[tokio::test]
    async fn test_update_pins_digest_when_template_changes() {
        let mock = MockGateway::new("default");
        let (manager, _) = setup(&mock);
        manager
            .create("foo", &image("gcr.io/foo/bar:baz"), &CreateOptions::new())
            .await
            .unwrap();

        let updated = manager
            .update("foo", &edit(|f| f.env = vec!["A=1".into()]), &UpdateOptions::new())
            .await
            .unwrap();
        assert!(updated.image().unwrap().starts_with("gcr.io/foo/bar@sha256:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_with_wait() {
        let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
        let (manager, output) = setup(&mock);

        manager
            .delete("foo", &DeleteOptions::new().with_wait(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(mock.calls(), vec!["WatchService(foo)", "DeleteService(foo)"]);
        assert!(mock.service("foo").is_none());
        assert!(output.lock().unwrap().contains("successfully deleted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_wait_times_out() {
        let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
        mock.set_watch_events(vec![]);
        mock.hold_deletions();
        let (manager, _) = setup(&mock);

        let err = manager
            .delete("foo", &DeleteOptions::new().with_wait(Duration::from_secs(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_delete_without_wait() {
        let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
        let (manager, _) = setup(&mock);
        manager.delete("foo", &DeleteOptions::new()).await.unwrap();
        assert_eq!(mock.calls(), vec!["DeleteService(foo)"]);
    }

    #[tokio::test]
    async fn test_delete_with_zero_timeout_does_not_wait() {
        let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
        mock.set_watch_events(vec![]);
        let (manager, output) = setup(&mock);

        manager
            .delete("foo", &DeleteOptions::new().with_wait(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(mock.calls(), vec!["DeleteService(foo)"]);
        assert!(mock.service("foo").is_none());
        assert!(output.lock().unwrap().contains("successfully deleted"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_wait_confirms_removal_when_event_is_missed() {
        let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
        mock.set_watch_events(vec![]);
        let (manager, _) = setup(&mock);

        manager
            .delete("foo", &DeleteOptions::new().with_wait(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(
            mock.calls(),
            vec!["WatchService(foo)", "DeleteService(foo)", "GetService(foo)"]
        );
    }

    #[tokio::test]
    async fn test_readiness_failure_is_terminal() {
        let mock = MockGateway::new("default");
        mock.set_wait_outcome(WaitOutcome::Failed {
            reason: "RevisionFailed".into(),
            message: "image pull failed".into(),
        });
        let (manager, _) = setup(&mock);

        let err = manager
            .create("foo", &image("img"), &CreateOptions::new().with_wait(wait()))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::ReadinessFailed { .. }));
        assert!(mock.service("foo").is_some());
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let source = MockGateway::new("default");
        let (manager, _) = setup(&source);
        manager
            .create("foo", &image("img:1"), &CreateOptions::new())
            .await
            .unwrap();
        let first = source.service("foo").unwrap().latest_created_revision().unwrap().to_string();
        manager
            .update("foo", &image("img:2"), &UpdateOptions::new())
            .await
            .unwrap();

        // route half the traffic to the first revision so it is exported
        let mut routed = source.service("foo").unwrap();
        routed.spec.traffic = vec![
            TrafficTarget::revision(first.clone(), 50),
            TrafficTarget::latest(50),
        ];
        let routed = source.update_service(&routed).await.unwrap();

        let export = manager.export("foo", true).await.unwrap();
        assert_eq!(export.spec.revisions.len(), 1);

        let text = serde_yaml::to_string(&export.to_value().unwrap()).unwrap();
        let parsed = Export::parse(&text).unwrap();

        let target = MockGateway::new("restore");
        let (importer, _) = setup(&target);
        let imported = importer.import(&parsed, &ImportOptions::new()).await.unwrap();

        assert_eq!(imported.metadata.namespace.as_deref(), Some("restore"));
        assert_eq!(imported.spec.traffic, routed.spec.traffic);
        assert_eq!(imported.image(), Some("img:2"));
        assert_eq!(
            imported.spec.template.metadata.name.as_deref(),
            routed.latest_created_revision()
        );
        let adopted = target
            .revisions()
            .into_iter()
            .find(|r| r.metadata.name.as_deref() == Some(first.as_str()))
            .unwrap();
        let owner = &adopted.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Configuration");
        assert_eq!(owner.name, "foo");
        assert_eq!(label(&adopted.metadata, serving::SERVICE_LABEL), Some("foo"));
    }

    #[tokio::test]
    async fn test_import_into_occupied_namespace_fails() {
        let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
        let (manager, _) = setup(&mock);
        let export = Export::new(&mock.service("foo").unwrap(), &[]);

        let err = manager.import(&export, &ImportOptions::new()).await.unwrap_err();
        assert!(matches!(err, KubeError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_describe_lists_routed_revisions() {
        let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
        let (manager, _) = setup(&mock);

        let description = manager.describe("foo").await.unwrap();
        assert!(description.service.is_ready());
        assert_eq!(description.revisions.len(), 1);
        assert_eq!(description.revisions[0].percent, 100);
    }

    #[tokio::test]
    async fn test_migrate_copies_services_and_revisions() {
        let source = MockGateway::new("old");
        let (source_manager, _) = setup(&source);
        source_manager
            .create("foo", &image("img:1"), &CreateOptions::new())
            .await
            .unwrap();
        source_manager
            .update(
                "foo",
                &edit(|f| {
                    f.image = vec!["img:2".into()];
                    f.lock_to_digest = false;
                }),
                &UpdateOptions::new(),
            )
            .await
            .unwrap();

        let destination = MockGateway::new("new");
        let (manager, _) = setup(&destination);
        let summary = manager
            .migrate(&source, &MigrateOptions::new().with_delete_source())
            .await
            .unwrap();

        assert_eq!(summary.migrated, vec!["foo"]);
        assert_eq!(summary.revisions, 1);
        assert_eq!(destination.revisions().len(), 2);
        assert_eq!(destination.service("foo").unwrap().image(), Some("img:2"));
        assert!(source.service("foo").is_none());
    }

    #[tokio::test]
    async fn test_migrate_conflict_without_force() {
        let source = MockGateway::with_services("old", vec![Service::with_image("foo", "old", "img")]);
        let destination = MockGateway::with_services("new", vec![Service::with_image("foo", "new", "img")]);
        let (manager, _) = setup(&destination);

        let err = manager
            .migrate(&source, &MigrateOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::AlreadyExists { .. }));

        let summary = manager
            .migrate(&source, &MigrateOptions::new().with_force())
            .await
            .unwrap();
        assert_eq!(summary.migrated, vec!["foo"]);
    }
}
