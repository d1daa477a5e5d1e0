//! Cluster gateway
//!
//! Talks to the Knative serving API through typed `kube::Api` handles. The
//! serving group is probed once at connect time: a cluster without it is
//! reported as [`KubeError::PlatformUnavailable`], and a cluster whose
//! service resource cannot be watched gets the polling watcher instead.

use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::verbs;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Config};
use knctl_core::annotations::serving;
use knctl_core::resources::{Configuration, Revision, Route, Service};

use super::{EventStream, ListFilter, PatchStrategy, ServingGateway, WatchEvent, sort_by_key};
use crate::error::{KubeError, Result};
use crate::poll::{DEFAULT_POLL_INTERVAL, PollingWatcher};

/// API group of the serving resources
pub const SERVING_GROUP: &str = "serving.knative.dev";

/// Attempts for idempotent reads failing with a transient error
const READ_ATTEMPTS: u32 = 3;

const READ_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Slack added to poll list timeouts so the server never gives up first
const POLL_LIST_SLACK: Duration = Duration::from_secs(30);

/// Build a client from an optional kubeconfig path and context
///
/// Returns the client with the namespace the kubeconfig selects.
pub async fn connect_client(
    kubeconfig: Option<&Path>,
    context: Option<&str>,
) -> Result<(Client, String)> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let invalid = |e: kube::config::KubeconfigError| KubeError::UserInput {
        message: format!("invalid kubeconfig: {e}"),
    };
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| KubeError::UserInput {
                message: format!("cannot read kubeconfig {}: {e}", path.display()),
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(invalid)?
        }
        None if context.is_some() => Config::from_kubeconfig(&options).await.map_err(invalid)?,
        None => Config::infer().await.map_err(|e| KubeError::UserInput {
            message: format!("cannot load cluster configuration: {e}"),
        })?,
    };

    let namespace = config.default_namespace.clone();
    let client = Client::try_from(config).map_err(|e| KubeError::PlatformUnavailable {
        message: e.to_string(),
    })?;
    Ok((client, namespace))
}

/// Gateway backed by a live cluster
pub struct ClusterGateway {
    client: Client,
    namespace: String,
    watch_supported: bool,
}

impl ClusterGateway {
    /// Probe the serving API and bind to `namespace`
    pub async fn connect(client: Client, namespace: impl Into<String>) -> Result<Self> {
        let group = kube::discovery::group(&client, SERVING_GROUP)
            .await
            .map_err(|e| KubeError::PlatformUnavailable {
                message: e.to_string(),
            })?;
        let (_, capabilities) =
            group
                .recommended_kind("Service")
                .ok_or_else(|| KubeError::PlatformUnavailable {
                    message: format!("{SERVING_GROUP} does not serve Service"),
                })?;
        let watch_supported = capabilities.supports_operation(verbs::WATCH);
        tracing::debug!(
            version = %group.preferred_version_or_latest(),
            watch_supported,
            "serving API discovered"
        );

        Ok(Self {
            client,
            namespace: namespace.into(),
            watch_supported,
        })
    }

    /// Use the polling watcher even when push watches are available
    pub fn with_polling(mut self) -> Self {
        self.watch_supported = false;
        self
    }

    fn api<K>(&self, all_namespaces: bool) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>,
    {
        if all_namespaces {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        }
    }

    /// Run an idempotent read, retrying transient failures
    async fn read<T, F, Fut>(&self, kind: &str, name: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, kube::Error>>,
    {
        let mut attempt = 1;
        loop {
            match call().await.map_err(|e| KubeError::classify(e, kind, name)) {
                Err(e) if e.is_transient() && attempt < READ_ATTEMPTS => {
                    tracing::debug!(kind, name, attempt, error = %e, "retrying read");
                    attempt += 1;
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    fn list_params(filter: &ListFilter, service_label: bool) -> ListParams {
        let mut params = ListParams::default();
        let mut selectors: Vec<String> = filter.label_selector.iter().cloned().collect();
        if service_label && let Some(service) = &filter.service {
            selectors.push(format!("{}={service}", serving::SERVICE_LABEL));
        }
        if !selectors.is_empty() {
            params = params.labels(&selectors.join(","));
        }
        if let Some(name) = &filter.name {
            params = params.fields(&format!("metadata.name={name}"));
        }
        if let Some(timeout) = filter.timeout {
            params = params.timeout(u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX));
        }
        params
    }

    fn native_watch(&self, name: &str, timeout: Duration) -> EventStream<Service> {
        let api: Api<Service> = self.api(false);
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        watcher(api, config)
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::InitApply(service)) => Some(WatchEvent::Added(service)),
                    Ok(watcher::Event::Apply(service)) => Some(WatchEvent::Modified(service)),
                    Ok(watcher::Event::Delete(service)) => Some(WatchEvent::Deleted(service)),
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                    Err(e) => Some(WatchEvent::Error(e.to_string())),
                }
            })
            .take_until(tokio::time::sleep(timeout))
            .boxed()
    }

    fn polling_watch(&self, name: &str, timeout: Duration) -> EventStream<Service> {
        let api: Api<Service> = self.api(false);
        let name = name.to_string();
        let list_timeout = timeout + POLL_LIST_SLACK;
        let fetch = move || {
            let api = api.clone();
            let name = name.clone();
            async move {
                let params = ListParams::default()
                    .fields(&format!("metadata.name={name}"))
                    .timeout(u32::try_from(list_timeout.as_secs()).unwrap_or(u32::MAX));
                let list = api
                    .list(&params)
                    .await
                    .map_err(|e| KubeError::classify(e, "service", &name))?;
                Ok(list.items.into_iter().next())
            }
        };
        PollingWatcher::start(fetch, DEFAULT_POLL_INTERVAL)
            .into_stream()
            .take_until(tokio::time::sleep(timeout))
            .boxed()
    }
}

fn delete_params(grace: Duration) -> DeleteParams {
    if grace.is_zero() {
        DeleteParams::background()
    } else {
        DeleteParams::foreground()
    }
}

fn object_name<K: kube::Resource>(object: &K) -> Result<String> {
    object
        .meta()
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| KubeError::Invalid {
            field: "metadata.name".to_string(),
            detail: "Required value".to_string(),
        })
}

#[async_trait]
impl ServingGateway for ClusterGateway {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn backend(&self) -> &'static str {
        "cluster"
    }

    // ========== Services ==========

    async fn get_service(&self, name: &str) -> Result<Service> {
        tracing::debug!(name, namespace = %self.namespace, "GetService");
        let api: Api<Service> = self.api(false);
        self.read("service", name, || api.get(name)).await
    }

    async fn list_services(&self, filter: &ListFilter) -> Result<Vec<Service>> {
        tracing::debug!(?filter, "ListServices");
        let api: Api<Service> = self.api(filter.all_namespaces);
        let params = Self::list_params(filter, false);
        let list = self.read("service", "", || api.list(&params)).await?;
        let mut services = list.items;
        sort_by_key(&mut services);
        Ok(services)
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        let name = object_name(service)?;
        tracing::debug!(%name, "CreateService");
        let api: Api<Service> = self.api(false);
        api.create(&PostParams::default(), service)
            .await
            .map_err(|e| KubeError::classify(e, "service", &name))
    }

    async fn update_service(&self, service: &Service) -> Result<Service> {
        let name = object_name(service)?;
        tracing::debug!(
            %name,
            resource_version = ?service.metadata.resource_version,
            "UpdateService"
        );
        let api: Api<Service> = self.api(false);
        api.replace(&name, &PostParams::default(), service)
            .await
            .map_err(|e| KubeError::classify(e, "service", &name))
    }

    async fn patch_service(
        &self,
        name: &str,
        strategy: PatchStrategy,
        patch: &serde_json::Value,
    ) -> Result<Service> {
        tracing::debug!(name, ?strategy, "PatchService");
        let api: Api<Service> = self.api(false);
        let patch = match strategy {
            PatchStrategy::Merge => Patch::Merge(patch),
            PatchStrategy::Strategic => Patch::Strategic(patch),
        };
        api.patch(name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| KubeError::classify(e, "service", name))
    }

    async fn delete_service(&self, name: &str, grace: Duration) -> Result<()> {
        tracing::debug!(name, grace_secs = grace.as_secs(), "DeleteService");
        let api: Api<Service> = self.api(false);
        api.delete(name, &delete_params(grace))
            .await
            .map(|_| ())
            .map_err(|e| KubeError::classify(e, "service", name))
    }

    async fn watch_service(&self, name: &str, timeout: Duration) -> Result<EventStream<Service>> {
        tracing::debug!(name, timeout_secs = timeout.as_secs(), polling = !self.watch_supported, "WatchService");
        Ok(if self.watch_supported {
            self.native_watch(name, timeout)
        } else {
            self.polling_watch(name, timeout)
        })
    }

    // ========== Revisions ==========

    async fn get_revision(&self, name: &str) -> Result<Revision> {
        tracing::debug!(name, "GetRevision");
        let api: Api<Revision> = self.api(false);
        self.read("revision", name, || api.get(name)).await
    }

    async fn list_revisions(&self, filter: &ListFilter) -> Result<Vec<Revision>> {
        tracing::debug!(?filter, "ListRevisions");
        let api: Api<Revision> = self.api(filter.all_namespaces);
        let params = Self::list_params(filter, true);
        let list = self.read("revision", "", || api.list(&params)).await?;
        let mut revisions = list.items;
        sort_by_key(&mut revisions);
        Ok(revisions)
    }

    async fn create_revision(&self, revision: &Revision) -> Result<Revision> {
        let name = object_name(revision)?;
        tracing::debug!(%name, "CreateRevision");
        let api: Api<Revision> = self.api(false);
        api.create(&PostParams::default(), revision)
            .await
            .map_err(|e| KubeError::classify(e, "revision", &name))
    }

    async fn update_revision(&self, revision: &Revision) -> Result<Revision> {
        let name = object_name(revision)?;
        tracing::debug!(%name, "UpdateRevision");
        let api: Api<Revision> = self.api(false);
        api.replace(&name, &PostParams::default(), revision)
            .await
            .map_err(|e| KubeError::classify(e, "revision", &name))
    }

    async fn delete_revision(&self, name: &str, grace: Duration) -> Result<()> {
        tracing::debug!(name, "DeleteRevision");
        let api: Api<Revision> = self.api(false);
        api.delete(name, &delete_params(grace))
            .await
            .map(|_| ())
            .map_err(|e| KubeError::classify(e, "revision", name))
    }

    // ========== Configurations and routes ==========

    async fn get_configuration(&self, name: &str) -> Result<Configuration> {
        tracing::debug!(name, "GetConfiguration");
        let api: Api<Configuration> = self.api(false);
        self.read("configuration", name, || api.get(name)).await
    }

    async fn get_route(&self, name: &str) -> Result<Route> {
        tracing::debug!(name, "GetRoute");
        let api: Api<Route> = self.api(false);
        self.read("route", name, || api.get(name)).await
    }

    async fn list_routes(&self, filter: &ListFilter) -> Result<Vec<Route>> {
        tracing::debug!(?filter, "ListRoutes");
        let api: Api<Route> = self.api(filter.all_namespaces);
        let params = Self::list_params(filter, true);
        let list = self.read("route", "", || api.list(&params)).await?;
        let mut routes = list.items;
        sort_by_key(&mut routes);
        Ok(routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_params_combine_selectors() {
        let filter = ListFilter::new()
            .with_labels("team=web")
            .with_service("foo")
            .with_name("foo-00001")
            .with_timeout(Duration::from_secs(90));

        let params = ClusterGateway::list_params(&filter, true);
        assert_eq!(
            params.label_selector.as_deref(),
            Some("team=web,serving.knative.dev/service=foo")
        );
        assert_eq!(params.field_selector.as_deref(), Some("metadata.name=foo-00001"));
        assert_eq!(params.timeout, Some(90));

        let params = ClusterGateway::list_params(&filter, false);
        assert_eq!(params.label_selector.as_deref(), Some("team=web"));
    }

    #[test]
    fn test_delete_params_by_grace() {
        assert!(matches!(
            delete_params(Duration::ZERO).propagation_policy,
            Some(kube::api::PropagationPolicy::Background)
        ));
        assert!(matches!(
            delete_params(Duration::from_secs(30)).propagation_policy,
            Some(kube::api::PropagationPolicy::Foreground)
        ));
    }

    #[test]
    fn test_object_name_required() {
        let service = Service::new("", Default::default());
        assert!(matches!(
            object_name(&service),
            Err(KubeError::Invalid { .. })
        ));
    }
}
