//! GitOps gateway
//!
//! Persists services as YAML manifests in a directory tree:
//!
//! ```text
//! <root>/<namespace>/ksvc/<name>.yaml
//! ```
//!
//! The tree is the source of truth, so there is no live status: waits
//! succeed immediately and revision history does not exist.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use knctl_core::canonical::{prune_metadata, strip_empty_pod_fields, strip_server_metadata};
use knctl_core::merge::apply_merge_patch;
use knctl_core::resources::{Configuration, Revision, Route, Service};

use super::{EventStream, ListFilter, PatchStrategy, ServingGateway, sort_by_key};
use crate::error::{KubeError, Result};
use crate::wait::{MessageCallback, WaitConfig, WaitOutcome};

/// Directory holding service manifests inside a namespace directory
const SERVICE_DIR: &str = "ksvc";

const BACKEND: &str = "gitops";

/// File-backed gateway
pub struct GitOpsGateway {
    root: PathBuf,
    namespace: String,
}

impl GitOpsGateway {
    /// Create a gateway rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>, namespace: impl Into<String>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            namespace: namespace.into(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a service manifest
    fn service_path(&self, name: &str) -> PathBuf {
        self.root
            .join(&self.namespace)
            .join(SERVICE_DIR)
            .join(format!("{name}.yaml"))
    }

    fn read_service(&self, path: &Path) -> Result<Service> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Write a manifest without status and server-owned metadata
    fn write_service(&self, service: &Service) -> Result<()> {
        let name = service_name(service)?;
        let path = self.service_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut service = service.clone();
        service.metadata.namespace = Some(self.namespace.clone());
        let mut value = serde_json::to_value(&service)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("status");
            if let Some(meta) = object.get_mut("metadata") {
                strip_server_metadata(meta);
            }
            prune_metadata(object);
        }
        if let Some(spec) = value.pointer_mut("/spec/template/spec") {
            strip_empty_pod_fields(spec);
        }

        std::fs::write(&path, serde_yaml::to_string(&value)?)?;
        tracing::debug!(path = %path.display(), "wrote service manifest");
        Ok(())
    }

    /// Namespace directories to scan for a list
    fn namespace_dirs(&self, all_namespaces: bool) -> Result<Vec<PathBuf>> {
        if !all_namespaces {
            let path = self.root.join(&self.namespace);
            return Ok(if path.is_dir() { vec![path] } else { vec![] });
        }
        Ok(std::fs::read_dir(&self.root)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect())
    }

    fn unsupported(&self, operation: &str) -> KubeError {
        KubeError::Unsupported {
            operation: operation.to_string(),
            backend: BACKEND,
        }
    }
}

fn service_name(service: &Service) -> Result<&str> {
    service
        .metadata
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| KubeError::Invalid {
            field: "metadata.name".to_string(),
            detail: "Required value".to_string(),
        })
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .is_some_and(|e| e == "yaml" || e == "yml")
}

#[async_trait]
impl ServingGateway for GitOpsGateway {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn get_service(&self, name: &str) -> Result<Service> {
        let path = self.service_path(name);
        if !path.exists() {
            return Err(KubeError::not_found("service", name));
        }
        self.read_service(&path)
    }

    async fn list_services(&self, filter: &ListFilter) -> Result<Vec<Service>> {
        let mut services = Vec::new();
        for ns_path in self.namespace_dirs(filter.all_namespaces)? {
            let dir = ns_path.join(SERVICE_DIR);
            if !dir.is_dir() {
                continue;
            }
            let files: Vec<PathBuf> = std::fs::read_dir(&dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && is_yaml(p))
                .collect();
            for file in files {
                match self.read_service(&file) {
                    Ok(service) if filter.matches(&service.metadata) => services.push(service),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(path = %file.display(), error = %e, "skipping unreadable manifest");
                    }
                }
            }
        }
        sort_by_key(&mut services);
        Ok(services)
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        let name = service_name(service)?;
        if self.service_path(name).exists() {
            return Err(KubeError::AlreadyExists {
                kind: "service".to_string(),
                name: name.to_string(),
            });
        }
        self.write_service(service)?;
        self.get_service(name).await
    }

    async fn update_service(&self, service: &Service) -> Result<Service> {
        let name = service_name(service)?;
        if !self.service_path(name).exists() {
            return Err(KubeError::not_found("service", name));
        }
        self.write_service(service)?;
        self.get_service(name).await
    }

    async fn patch_service(
        &self,
        name: &str,
        strategy: PatchStrategy,
        patch: &serde_json::Value,
    ) -> Result<Service> {
        if strategy != PatchStrategy::Merge {
            return Err(self.unsupported("strategic merge patch"));
        }
        let current = self.get_service(name).await?;
        let mut value = serde_json::to_value(&current)?;
        apply_merge_patch(&mut value, patch);
        let patched: Service = serde_json::from_value(value)?;
        self.write_service(&patched)?;
        self.get_service(name).await
    }

    async fn delete_service(&self, name: &str, _grace: Duration) -> Result<()> {
        let path = self.service_path(name);
        if !path.exists() {
            return Err(KubeError::not_found("service", name));
        }
        std::fs::remove_file(&path)?;
        Ok(())
    }

    async fn watch_service(&self, _name: &str, _timeout: Duration) -> Result<EventStream<Service>> {
        Err(self.unsupported("watch"))
    }

    async fn get_revision(&self, name: &str) -> Result<Revision> {
        Err(KubeError::not_found("revision", name))
    }

    async fn list_revisions(&self, _filter: &ListFilter) -> Result<Vec<Revision>> {
        Ok(Vec::new())
    }

    async fn create_revision(&self, _revision: &Revision) -> Result<Revision> {
        Err(self.unsupported("creating revisions"))
    }

    async fn update_revision(&self, _revision: &Revision) -> Result<Revision> {
        Err(self.unsupported("updating revisions"))
    }

    async fn delete_revision(&self, _name: &str, _grace: Duration) -> Result<()> {
        Err(self.unsupported("deleting revisions"))
    }

    async fn get_configuration(&self, name: &str) -> Result<Configuration> {
        Err(KubeError::not_found("configuration", name))
    }

    async fn get_route(&self, name: &str) -> Result<Route> {
        Err(KubeError::not_found("route", name))
    }

    async fn list_routes(&self, _filter: &ListFilter) -> Result<Vec<Route>> {
        Ok(Vec::new())
    }

    async fn wait_for_service(
        &self,
        _name: &str,
        _config: &WaitConfig,
        _on_message: &MessageCallback<'_>,
    ) -> Result<WaitOutcome> {
        Ok(WaitOutcome::Ready)
    }

    async fn delete_service_and_wait(&self, name: &str, timeout: Duration) -> Result<()> {
        self.delete_service(name, timeout).await
    }
}
