//! Scripted in-memory gateway for testing
//!
//! Stores objects in memory, records every call in order and lets tests
//! script failures and watch events. Services behave like a tiny control
//! plane: a template change stamps a new ready revision and the status URL
//! is `http://<name>.example.com`.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use knctl_core::annotations::serving;
use knctl_core::merge::apply_merge_patch;
use knctl_core::resources::{
    Condition, ConditionStatus, Configuration, ConfigurationSpec, ConfigurationStatus, Revision,
    RevisionStatus, Route, Service, ServiceStatus, TrafficTarget,
};

use super::{EventStream, ListFilter, PatchStrategy, ServingGateway, WatchEvent, sort_by_key};
use crate::error::{KubeError, Result};
use crate::wait::{MessageCallback, WaitConfig, WaitOutcome};

/// Failure a test can queue for a named operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedError {
    NotFound,
    Conflict,
    Transient,
    Unauthorized,
    Invalid(String),
}

impl ScriptedError {
    fn into_error(self, kind: &str, name: &str) -> KubeError {
        match self {
            ScriptedError::NotFound => KubeError::not_found(kind, name),
            ScriptedError::Conflict => KubeError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                message: "the object has been modified".to_string(),
            },
            ScriptedError::Transient => KubeError::Transient {
                message: "connection reset by peer".to_string(),
            },
            ScriptedError::Unauthorized => KubeError::Unauthorized {
                message: "forbidden".to_string(),
            },
            ScriptedError::Invalid(detail) => KubeError::Invalid {
                field: "spec".to_string(),
                detail,
            },
        }
    }
}

#[derive(Default)]
struct MockState {
    services: BTreeMap<String, Service>,
    revisions: BTreeMap<String, Revision>,
    configurations: BTreeMap<String, Configuration>,
    routes: BTreeMap<String, Route>,
    calls: Vec<String>,
    failures: HashMap<String, VecDeque<ScriptedError>>,
    wait_outcome: Option<WaitOutcome>,
    watch_events: Option<Vec<WatchEvent<Service>>>,
    hold_deletions: bool,
    next_uid: u64,
    next_version: u64,
}

impl MockState {
    fn record(&mut self, op: &str, name: &str) -> Option<ScriptedError> {
        self.calls.push(format!("{op}({name})"));
        self.failures.get_mut(op).and_then(VecDeque::pop_front)
    }

    fn uid(&mut self) -> String {
        self.next_uid += 1;
        format!("uid-{:04}", self.next_uid)
    }

    fn version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    /// Stamp a revision when the template changed, then resolve status
    fn reconcile(&mut self, service: &mut Service, previous: Option<&Service>) {
        let name = service.metadata.name.clone().unwrap_or_default();
        let namespace = service.metadata.namespace.clone().unwrap_or_default();
        let generation = service.metadata.generation.unwrap_or(1);

        if !self.configurations.contains_key(&name) {
            let mut configuration = Configuration::new(&name, ConfigurationSpec::default());
            configuration.metadata.namespace = Some(namespace.clone());
            configuration.metadata.uid = Some(self.uid());
            self.configurations.insert(name.clone(), configuration);
        }

        let template_changed =
            previous.is_none_or(|p| p.spec.template != service.spec.template);
        let revision_name = match (template_changed, previous.and_then(|p| p.latest_created_revision())) {
            (false, Some(existing)) => existing.to_string(),
            _ => service
                .spec
                .template
                .metadata
                .name
                .clone()
                .unwrap_or_else(|| format!("{name}-{generation:05}")),
        };

        if !self.revisions.contains_key(&revision_name) {
            let mut labels = service.spec.template.metadata.labels.clone().unwrap_or_default();
            labels.insert(serving::SERVICE_LABEL.to_string(), name.clone());
            labels.insert(serving::CONFIGURATION_LABEL.to_string(), name.clone());
            labels.insert(
                serving::CONFIGURATION_GENERATION_LABEL.to_string(),
                generation.to_string(),
            );
            let mut revision = Revision::new(&revision_name, service.spec.template.spec.clone());
            revision.metadata = ObjectMeta {
                name: Some(revision_name.clone()),
                namespace: Some(namespace.clone()),
                uid: Some(self.uid()),
                generation: Some(1),
                labels: Some(labels),
                annotations: service.spec.template.metadata.annotations.clone(),
                ..Default::default()
            };
            revision.status = Some(RevisionStatus {
                observed_generation: Some(1),
                conditions: vec![Condition::new("Ready", ConditionStatus::True)],
                image_digest: service
                    .image()
                    .map(|image| format!("{}@sha256:{:064}", image_repository(image), generation)),
                ..Default::default()
            });
            self.revisions.insert(revision_name.clone(), revision);
        }

        let traffic: Vec<TrafficTarget> = if service.spec.traffic.is_empty() {
            vec![TrafficTarget::revision(&revision_name, 100)]
        } else {
            service
                .spec
                .traffic
                .iter()
                .map(|t| {
                    let mut target = t.clone();
                    if target.is_latest() {
                        target.revision_name = Some(revision_name.clone());
                    }
                    target
                })
                .collect()
        };

        let mut route = Route::new(&name, Default::default());
        route.metadata.namespace = Some(namespace);
        route.spec.traffic = traffic.clone();
        self.routes.insert(name.clone(), route);

        service.status = Some(ServiceStatus {
            observed_generation: Some(generation),
            conditions: vec![Condition::new("Ready", ConditionStatus::True)],
            url: Some(format!("http://{name}.example.com")),
            latest_created_revision_name: Some(revision_name.clone()),
            latest_ready_revision_name: Some(revision_name),
            traffic,
            ..Default::default()
        });
    }
}

/// Repository part of an image reference, without tag or digest
fn image_repository(image: &str) -> &str {
    let image = image.split('@').next().unwrap_or(image);
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => repo,
        _ => image,
    }
}

/// The object as a write returns it: the status still describes the
/// previous generation until the controller catches up
fn as_written(mut service: Service, previous: &Service) -> Service {
    if let Some(status) = service.status.as_mut() {
        status.observed_generation = previous.metadata.generation;
    }
    service
}

/// In-memory gateway for testing
#[derive(Clone)]
pub struct MockGateway {
    namespace: String,
    state: Arc<RwLock<MockState>>,
}

impl MockGateway {
    /// Create an empty mock bound to `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: Arc::new(RwLock::new(MockState::default())),
        }
    }

    /// Create with pre-populated services, each reconciled to a ready revision
    pub fn with_services(namespace: impl Into<String>, services: Vec<Service>) -> Self {
        let mock = Self::new(namespace);
        {
            let mut state = mock.state.write().unwrap();
            for mut service in services {
                let name = service.metadata.name.clone().unwrap_or_default();
                service.metadata.namespace = Some(mock.namespace.clone());
                service.metadata.uid = Some(state.uid());
                service.metadata.resource_version = Some(state.version());
                service.metadata.generation = Some(1);
                state.reconcile(&mut service, None);
                state.services.insert(name, service);
            }
        }
        mock
    }

    /// Queue a failure for the next call of `op` (e.g. `"UpdateService"`)
    pub fn fail_next(&self, op: &str, error: ScriptedError) {
        self.fail_times(op, error, 1);
    }

    /// Queue the same failure for the next `times` calls of `op`
    pub fn fail_times(&self, op: &str, error: ScriptedError, times: usize) {
        let mut state = self.state.write().unwrap();
        let queue = state.failures.entry(op.to_string()).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Outcome returned by `wait_for_service` (default: ready)
    pub fn set_wait_outcome(&self, outcome: WaitOutcome) {
        self.state.write().unwrap().wait_outcome = Some(outcome);
    }

    /// Events yielded by `watch_service`; the stream then stays open
    pub fn set_watch_events(&self, events: Vec<WatchEvent<Service>>) {
        self.state.write().unwrap().watch_events = Some(events);
    }

    /// Keep deleted services around marked as terminating, as a finalizer would
    pub fn hold_deletions(&self) {
        self.state.write().unwrap().hold_deletions = true;
    }

    /// Recorded calls, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.read().unwrap().calls.clone()
    }

    /// Forget recorded calls
    pub fn reset_calls(&self) {
        self.state.write().unwrap().calls.clear();
    }

    /// Stored service, bypassing call recording
    pub fn service(&self, name: &str) -> Option<Service> {
        self.state.read().unwrap().services.get(name).cloned()
    }

    /// Replace a stored service as-is, bypassing versioning
    pub fn put_service(&self, service: Service) {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.state.write().unwrap().services.insert(name, service);
    }

    /// Stored revisions, bypassing call recording
    pub fn revisions(&self) -> Vec<Revision> {
        self.state.read().unwrap().revisions.values().cloned().collect()
    }

    /// Store a revision as-is
    pub fn put_revision(&self, revision: Revision) {
        let name = revision.metadata.name.clone().unwrap_or_default();
        self.state.write().unwrap().revisions.insert(name, revision);
    }
}

#[async_trait]
impl ServingGateway for MockGateway {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn backend(&self) -> &'static str {
        "mock"
    }

    async fn get_service(&self, name: &str) -> Result<Service> {
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("GetService", name) {
            return Err(err.into_error("service", name));
        }
        state
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| KubeError::not_found("service", name))
    }

    async fn list_services(&self, filter: &ListFilter) -> Result<Vec<Service>> {
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("ListServices", filter.name.as_deref().unwrap_or("")) {
            return Err(err.into_error("service", ""));
        }
        let mut services: Vec<Service> = state
            .services
            .values()
            .filter(|s| filter.matches(&s.metadata))
            .cloned()
            .collect();
        sort_by_key(&mut services);
        Ok(services)
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("CreateService", &name) {
            return Err(err.into_error("service", &name));
        }
        if state.services.contains_key(&name) {
            return Err(KubeError::AlreadyExists {
                kind: "service".to_string(),
                name,
            });
        }
        let mut created = service.clone();
        created.metadata.namespace = Some(self.namespace.clone());
        created.metadata.uid = Some(state.uid());
        created.metadata.resource_version = Some(state.version());
        created.metadata.generation = Some(1);
        state.reconcile(&mut created, None);
        state.services.insert(name, created.clone());
        Ok(created)
    }

    async fn update_service(&self, service: &Service) -> Result<Service> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("UpdateService", &name) {
            return Err(err.into_error("service", &name));
        }
        let current = state
            .services
            .get(&name)
            .cloned()
            .ok_or_else(|| KubeError::not_found("service", &name))?;
        if service.metadata.resource_version.is_some()
            && service.metadata.resource_version != current.metadata.resource_version
        {
            return Err(ScriptedError::Conflict.into_error("service", &name));
        }

        let mut updated = service.clone();
        updated.metadata.uid = current.metadata.uid.clone();
        updated.metadata.namespace = current.metadata.namespace.clone();
        updated.metadata.resource_version = Some(state.version());
        let generation = current.metadata.generation.unwrap_or(1);
        updated.metadata.generation = Some(if updated.spec != current.spec {
            generation + 1
        } else {
            generation
        });
        state.reconcile(&mut updated, Some(&current));
        state.services.insert(name, updated.clone());
        Ok(as_written(updated, &current))
    }

    async fn patch_service(
        &self,
        name: &str,
        strategy: PatchStrategy,
        patch: &serde_json::Value,
    ) -> Result<Service> {
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("PatchService", name) {
            return Err(err.into_error("service", name));
        }
        tracing::trace!(?strategy, "mock patch");
        let current = state
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| KubeError::not_found("service", name))?;

        let mut value = serde_json::to_value(&current)?;
        apply_merge_patch(&mut value, patch);
        let mut patched: Service = serde_json::from_value(value)?;
        patched.metadata.resource_version = Some(state.version());
        let generation = current.metadata.generation.unwrap_or(1);
        patched.metadata.generation = Some(if patched.spec != current.spec {
            generation + 1
        } else {
            generation
        });
        state.reconcile(&mut patched, Some(&current));
        state.services.insert(name.to_string(), patched.clone());
        Ok(as_written(patched, &current))
    }

    async fn delete_service(&self, name: &str, _grace: Duration) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("DeleteService", name) {
            return Err(err.into_error("service", name));
        }
        if state.hold_deletions {
            let service = state
                .services
                .get_mut(name)
                .ok_or_else(|| KubeError::not_found("service", name))?;
            service.metadata.deletion_timestamp =
                Some(Time(k8s_openapi::chrono::Utc::now()));
            return Ok(());
        }
        state
            .services
            .remove(name)
            .ok_or_else(|| KubeError::not_found("service", name))?;
        state.configurations.remove(name);
        state.routes.remove(name);
        state
            .revisions
            .retain(|_, r| r.service_name() != Some(name));
        Ok(())
    }

    async fn watch_service(&self, name: &str, _timeout: Duration) -> Result<EventStream<Service>> {
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("WatchService", name) {
            return Err(err.into_error("service", name));
        }
        let events = match state.watch_events.clone() {
            Some(events) => events,
            None => {
                let current = state
                    .services
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| Service::new(name, Default::default()));
                vec![WatchEvent::Deleted(current)]
            }
        };
        Ok(futures::stream::iter(events)
            .chain(futures::stream::pending())
            .boxed())
    }

    async fn get_revision(&self, name: &str) -> Result<Revision> {
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("GetRevision", name) {
            return Err(err.into_error("revision", name));
        }
        state
            .revisions
            .get(name)
            .cloned()
            .ok_or_else(|| KubeError::not_found("revision", name))
    }

    async fn list_revisions(&self, filter: &ListFilter) -> Result<Vec<Revision>> {
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("ListRevisions", filter.service.as_deref().unwrap_or("")) {
            return Err(err.into_error("revision", ""));
        }
        let mut revisions: Vec<Revision> = state
            .revisions
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .cloned()
            .collect();
        sort_by_key(&mut revisions);
        Ok(revisions)
    }

    async fn create_revision(&self, revision: &Revision) -> Result<Revision> {
        let name = revision.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("CreateRevision", &name) {
            return Err(err.into_error("revision", &name));
        }
        if state.revisions.contains_key(&name) {
            return Err(KubeError::AlreadyExists {
                kind: "revision".to_string(),
                name,
            });
        }
        let mut created = revision.clone();
        created.metadata.namespace = Some(self.namespace.clone());
        created.metadata.uid = Some(state.uid());
        created.metadata.resource_version = Some(state.version());
        state.revisions.insert(name, created.clone());
        Ok(created)
    }

    async fn update_revision(&self, revision: &Revision) -> Result<Revision> {
        let name = revision.metadata.name.clone().unwrap_or_default();
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("UpdateRevision", &name) {
            return Err(err.into_error("revision", &name));
        }
        if !state.revisions.contains_key(&name) {
            return Err(KubeError::not_found("revision", &name));
        }
        let mut updated = revision.clone();
        updated.metadata.resource_version = Some(state.version());
        state.revisions.insert(name, updated.clone());
        Ok(updated)
    }

    async fn delete_revision(&self, name: &str, _grace: Duration) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("DeleteRevision", name) {
            return Err(err.into_error("revision", name));
        }
        state
            .revisions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| KubeError::not_found("revision", name))
    }

    async fn get_configuration(&self, name: &str) -> Result<Configuration> {
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("GetConfiguration", name) {
            return Err(err.into_error("configuration", name));
        }
        state
            .configurations
            .get(name)
            .cloned()
            .map(|mut configuration| {
                configuration.status = Some(ConfigurationStatus::default());
                configuration
            })
            .ok_or_else(|| KubeError::not_found("configuration", name))
    }

    async fn get_route(&self, name: &str) -> Result<Route> {
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("GetRoute", name) {
            return Err(err.into_error("route", name));
        }
        state
            .routes
            .get(name)
            .cloned()
            .ok_or_else(|| KubeError::not_found("route", name))
    }

    async fn list_routes(&self, filter: &ListFilter) -> Result<Vec<Route>> {
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("ListRoutes", filter.name.as_deref().unwrap_or("")) {
            return Err(err.into_error("route", ""));
        }
        let mut routes: Vec<Route> = state
            .routes
            .values()
            .filter(|r| filter.matches(&r.metadata))
            .cloned()
            .collect();
        sort_by_key(&mut routes);
        Ok(routes)
    }

    async fn wait_for_service(
        &self,
        name: &str,
        _config: &WaitConfig,
        _on_message: &MessageCallback<'_>,
    ) -> Result<WaitOutcome> {
        let mut state = self.state.write().unwrap();
        if let Some(err) = state.record("WaitForService", name) {
            return Err(err.into_error("service", name));
        }
        Ok(state.wait_outcome.clone().unwrap_or(WaitOutcome::Ready))
    }
}
