//! Migrate command - copy every service of a namespace to another

use std::path::PathBuf;

use clap::Args;
use knctl_kube::{MigrateOptions, ServiceManager};

use super::{Context, Endpoint};
use crate::display;
use crate::error::Result;
use crate::flags::{OutputFormat, WaitArgs};

#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Namespace to copy from (defaults to the selected namespace)
    #[arg(long)]
    pub source_namespace: Option<String>,

    /// Namespace to copy to
    #[arg(long)]
    pub destination_namespace: String,

    /// Kubeconfig of the destination cluster
    #[arg(long, env = "KUBECONFIG_DESTINATION", value_name = "PATH")]
    pub destination_kubeconfig: Option<PathBuf>,

    /// Kubeconfig context of the destination cluster
    #[arg(long)]
    pub destination_context: Option<String>,

    /// Replace services that already exist at the destination
    #[arg(long)]
    pub force: bool,

    /// Delete each source service once it was copied
    #[arg(long)]
    pub delete: bool,

    #[command(flatten)]
    pub wait: WaitArgs,
}

/// Run the migrate command
pub async fn run(ctx: &Context, args: &MigrateArgs) -> Result<()> {
    let source = ctx
        .connect(Endpoint {
            namespace: args
                .source_namespace
                .as_deref()
                .or(ctx.global.namespace.as_deref()),
            ..ctx.endpoint()
        })
        .await?;

    let destination_endpoint = if args.destination_kubeconfig.is_some() {
        Endpoint {
            kubeconfig: args.destination_kubeconfig.as_deref(),
            context: args.destination_context.as_deref(),
            namespace: Some(&args.destination_namespace),
        }
    } else {
        Endpoint {
            context: args
                .destination_context
                .as_deref()
                .or(ctx.global.context.as_deref()),
            namespace: Some(&args.destination_namespace),
            ..ctx.endpoint()
        }
    };
    let destination = ctx.connect(destination_endpoint).await?;

    let mut options = MigrateOptions::new();
    if args.force {
        options = options.with_force();
    }
    if args.delete {
        options = options.with_delete_source();
    }
    if let Some(wait) = args.wait.config(&ctx.config.defaults) {
        options.delete_timeout = wait.timeout;
        options = options.with_wait(wait);
    }

    let manager = ServiceManager::new(destination).with_progress(ctx.progress(OutputFormat::Human));
    let summary = manager.migrate(source.as_ref(), &options).await?;
    if !summary.migrated.is_empty() {
        display::success(&format!(
            "Migrated {} service(s) and {} revision(s) from namespace '{}' to '{}'",
            summary.migrated.len(),
            summary.revisions,
            source.namespace(),
            args.destination_namespace
        ));
    }
    Ok(())
}
