//! CLI commands

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use knctl_kube::{
    ClusterGateway, GitOpsGateway, ProgressReporter, ServiceManager, ServingGateway,
    connect_client,
};

use crate::config::{self, Config};
use crate::error::Result;
use crate::flags::OutputFormat;

// Service lifecycle
pub mod apply;
pub mod create;
pub mod delete;
pub mod describe;
pub mod export;
pub mod import;
pub mod list;
pub mod migrate;
pub mod update;

// Read-mostly resources
pub mod revision;
pub mod route;

/// Namespace used by the GitOps backend when none is selected
const GITOPS_DEFAULT_NAMESPACE: &str = "default";

/// Flags accepted by every command
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Namespace to operate in
    #[arg(short = 'n', long, global = true)]
    pub namespace: Option<String>,

    /// Path to the kubeconfig file
    #[arg(long, global = true, value_name = "PATH")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Write manifests under DIR instead of talking to a cluster (cache:NAME for the cache directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub target: Option<String>,

    /// Poll for changes instead of watching
    #[arg(long, global = true)]
    pub poll: bool,

    /// Log filter (error, warn, info, debug, trace or a tracing directive)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,
}

/// Where a gateway connects
#[derive(Debug, Clone, Copy, Default)]
pub struct Endpoint<'a> {
    pub kubeconfig: Option<&'a Path>,
    pub context: Option<&'a str>,
    pub namespace: Option<&'a str>,
}

/// Everything a command needs besides its own flags
pub struct Context {
    pub global: GlobalArgs,
    pub config: Config,
}

impl Context {
    pub fn new(global: GlobalArgs, config: Config) -> Self {
        Self { global, config }
    }

    /// Endpoint selected by the global flags
    pub fn endpoint(&self) -> Endpoint<'_> {
        Endpoint {
            kubeconfig: self.global.kubeconfig.as_deref(),
            context: self.global.context.as_deref(),
            namespace: self.global.namespace.as_deref(),
        }
    }

    /// Gateway for the global flags
    pub async fn gateway(&self) -> Result<Arc<dyn ServingGateway>> {
        self.connect(self.endpoint()).await
    }

    /// Gateway for an endpoint: GitOps with `--target`, the cluster otherwise
    pub async fn connect(&self, endpoint: Endpoint<'_>) -> Result<Arc<dyn ServingGateway>> {
        let namespace = endpoint
            .namespace
            .map(str::to_string)
            .or_else(|| self.config.defaults.namespace.clone());

        if let Some(target) = &self.global.target {
            let root = config::resolve_target(target, &config::cache_dir())?;
            let namespace = namespace.unwrap_or_else(|| GITOPS_DEFAULT_NAMESPACE.to_string());
            tracing::debug!(root = %root.display(), %namespace, "using GitOps backend");
            return Ok(Arc::new(GitOpsGateway::new(root, namespace)?));
        }

        let (client, kubeconfig_namespace) =
            connect_client(endpoint.kubeconfig, endpoint.context).await?;
        let namespace = namespace.unwrap_or(kubeconfig_namespace);
        let mut gateway = ClusterGateway::connect(client, namespace).await?;
        if self.global.poll {
            gateway = gateway.with_polling();
        }
        Ok(Arc::new(gateway))
    }

    /// Progress reporter, silent for machine-readable output
    pub fn progress(&self, format: OutputFormat) -> ProgressReporter {
        if format.is_machine() {
            ProgressReporter::silent()
        } else {
            ProgressReporter::new()
        }
    }

    /// Lifecycle coordinator over the selected gateway
    pub async fn manager(&self) -> Result<ServiceManager<dyn ServingGateway>> {
        Ok(ServiceManager::new(self.gateway().await?)
            .with_progress(self.progress(OutputFormat::Human)))
    }
}
