//! Serving gateways
//!
//! A [`ServingGateway`] is the only point of contact with a backend. Every
//! other component goes through it, which makes it the seam where retries
//! and error classification happen.
//!
//! Three implementations exist:
//! - **Cluster**: the Knative serving API of a live cluster
//! - **GitOps**: service manifests under `<root>/<namespace>/ksvc/<name>.yaml`
//! - **Mock**: scripted in-memory recorder for tests

mod cluster;
mod gitops;
mod mock;

pub use cluster::{ClusterGateway, connect_client};
pub use gitops::GitOpsGateway;
pub use mock::{MockGateway, ScriptedError};

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use knctl_core::resources::{Configuration, Revision, Route, Service, sort_key};

use crate::error::{KubeError, Result};
use crate::wait::{self, MessageCallback, WaitConfig, WaitOutcome};

/// Event of a watch-like stream for one resource
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// A fetch or watch failure; the stream stays open
    Error(String),
}

/// Ordered stream of watch events
pub type EventStream<K> = BoxStream<'static, WatchEvent<K>>;

/// Patch flavor for [`ServingGateway::patch_service`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStrategy {
    /// RFC 7386 JSON merge patch
    Merge,
    /// Kubernetes strategic merge patch
    Strategic,
}

/// Filter for list operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Exact object name
    pub name: Option<String>,
    /// Label selector, `k=v[,k2=v2]`
    pub label_selector: Option<String>,
    /// Parent service, for revisions and routes
    pub service: Option<String>,
    /// List across every namespace
    pub all_namespaces: bool,
    /// Server-side timeout of the list call
    pub timeout: Option<Duration>,
}

impl ListFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn all_namespaces(mut self) -> Self {
        self.all_namespaces = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Check an object's labels against the label and service filters
    ///
    /// Used by backends that filter client-side.
    pub fn matches(&self, meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> bool {
        if let Some(name) = &self.name
            && meta.name.as_ref() != Some(name)
        {
            return false;
        }
        let labels = meta.labels.clone().unwrap_or_default();
        if let Some(service) = &self.service
            && labels.get(knctl_core::annotations::serving::SERVICE_LABEL) != Some(service)
        {
            return false;
        }
        if let Some(selector) = &self.label_selector {
            for requirement in selector.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let matched = match requirement.split_once('=') {
                    Some((key, value)) => {
                        labels.get(key.trim()).map(String::as_str) == Some(value.trim())
                    }
                    None => labels.contains_key(requirement),
                };
                if !matched {
                    return false;
                }
            }
        }
        true
    }
}

/// Sort objects by `(namespace, name)`
pub fn sort_by_key<K: kube::Resource>(items: &mut [K]) {
    items.sort_by_key(|item| sort_key(item.meta()));
}

/// Typed facade over a serving backend, bound to one namespace
#[async_trait]
pub trait ServingGateway: Send + Sync {
    /// Namespace this gateway operates in
    fn namespace(&self) -> &str;

    /// Short backend name for messages
    fn backend(&self) -> &'static str;

    // ========== Services ==========

    async fn get_service(&self, name: &str) -> Result<Service>;

    /// List services, ordered by `(namespace, name)`
    async fn list_services(&self, filter: &ListFilter) -> Result<Vec<Service>>;

    async fn create_service(&self, service: &Service) -> Result<Service>;

    /// Replace a service; the caller supplies the resource version it read
    async fn update_service(&self, service: &Service) -> Result<Service>;

    async fn patch_service(
        &self,
        name: &str,
        strategy: PatchStrategy,
        patch: &serde_json::Value,
    ) -> Result<Service>;

    /// Delete a service
    ///
    /// A zero `grace` deletes in the background; otherwise dependents are
    /// removed first (foreground propagation).
    async fn delete_service(&self, name: &str, grace: Duration) -> Result<()>;

    /// Stream events for one service, ending after `timeout`
    async fn watch_service(&self, name: &str, timeout: Duration) -> Result<EventStream<Service>>;

    // ========== Revisions ==========

    async fn get_revision(&self, name: &str) -> Result<Revision>;

    async fn list_revisions(&self, filter: &ListFilter) -> Result<Vec<Revision>>;

    async fn create_revision(&self, revision: &Revision) -> Result<Revision>;

    async fn update_revision(&self, revision: &Revision) -> Result<Revision>;

    async fn delete_revision(&self, name: &str, grace: Duration) -> Result<()>;

    // ========== Configurations and routes ==========

    async fn get_configuration(&self, name: &str) -> Result<Configuration>;

    async fn get_route(&self, name: &str) -> Result<Route>;

    async fn list_routes(&self, filter: &ListFilter) -> Result<Vec<Route>>;

    // ========== Provided ==========

    /// Wait until a service's Ready condition resolves
    async fn wait_for_service(
        &self,
        name: &str,
        config: &WaitConfig,
        on_message: &MessageCallback<'_>,
    ) -> Result<WaitOutcome> {
        let events = self.watch_service(name, config.timeout).await?;
        Ok(wait::wait_for_ready(events, config, on_message).await)
    }

    /// Delete a service and wait for its `Deleted` event
    ///
    /// The delete call and the wait run concurrently and both must succeed.
    /// A watch may start after the object is already gone, so a wait that
    /// times out is confirmed with a read before it is reported. A zero
    /// timeout deletes without waiting.
    async fn delete_service_and_wait(&self, name: &str, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return self.delete_service(name, Duration::ZERO).await;
        }
        let events = self.watch_service(name, timeout).await?;
        let (deleted, waited) = tokio::join!(
            self.delete_service(name, timeout),
            wait::wait_for_deletion(events, name, timeout),
        );
        deleted?;
        if let Err(KubeError::Timeout { .. }) = &waited
            && !self.service_exists(name).await?
        {
            tracing::debug!(%name, "deletion event missed, service is gone");
            return Ok(());
        }
        waited
    }

    /// Whether a service exists
    async fn service_exists(&self, name: &str) -> Result<bool> {
        match self.get_service(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn meta(name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_filter_matches() {
        let m = meta(
            "foo-00001",
            &[("serving.knative.dev/service", "foo"), ("team", "web")],
        );
        assert!(ListFilter::new().matches(&m));
        assert!(ListFilter::new().with_service("foo").matches(&m));
        assert!(!ListFilter::new().with_service("bar").matches(&m));
        assert!(ListFilter::new().with_labels("team=web").matches(&m));
        assert!(ListFilter::new().with_labels("team").matches(&m));
        assert!(!ListFilter::new().with_labels("team=web,tier=db").matches(&m));
        assert!(!ListFilter::new().with_name("foo").matches(&m));
    }

    #[test]
    fn test_sort_by_namespace_then_name() {
        let mut services = vec![
            Service::with_image("b", "ns1", "img"),
            Service::with_image("a", "ns2", "img"),
            Service::with_image("a", "ns1", "img"),
        ];
        sort_by_key(&mut services);
        let keys: Vec<_> = services.iter().map(|s| sort_key(&s.metadata)).collect();
        assert_eq!(
            keys,
            vec![
                ("ns1".to_string(), "a".to_string()),
                ("ns1".to_string(), "b".to_string()),
                ("ns2".to_string(), "a".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_and_wait_with_zero_timeout_skips_watch() {
        let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
        mock.set_watch_events(vec![]);

        mock.delete_service_and_wait("foo", Duration::ZERO).await.unwrap();
        assert_eq!(mock.calls(), vec!["DeleteService(foo)"]);
        assert!(mock.service("foo").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_and_wait_reports_timeout_while_service_remains() {
        let mock = MockGateway::with_services("default", vec![Service::with_image("foo", "default", "img")]);
        mock.set_watch_events(vec![]);
        mock.hold_deletions();

        let err = mock
            .delete_service_and_wait("foo", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, KubeError::Timeout { .. }));
        assert!(mock.service("foo").unwrap().is_terminating());
    }
}
