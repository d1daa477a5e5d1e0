//! Delete command - remove services

use clap::Args;
use knctl_kube::{DeleteOptions, ListFilter};

use super::Context;
use crate::error::{CliError, Result};
use crate::flags::WaitArgs;

#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Services to delete
    pub names: Vec<String>,

    /// Delete every service in the namespace
    #[arg(long, conflicts_with = "names")]
    pub all: bool,

    #[command(flatten)]
    pub wait: WaitArgs,
}

/// Run the delete command
pub async fn run(ctx: &Context, args: &DeleteArgs) -> Result<()> {
    if args.names.is_empty() && !args.all {
        return Err(CliError::input_with_help(
            "no service name given",
            "Pass one or more names, or --all",
        ));
    }

    let mut options = DeleteOptions::new();
    if let Some(timeout) = args.wait.delete_timeout(&ctx.config.defaults) {
        options = options.with_wait(timeout);
    }

    let manager = ctx.manager().await?;
    let names = if args.all {
        manager
            .list(&ListFilter::new())
            .await?
            .into_iter()
            .filter_map(|s| s.metadata.name)
            .collect()
    } else {
        args.names.clone()
    };
    if names.is_empty() {
        println!("No services found.");
        return Ok(());
    }

    // Every name is attempted; failures are reported together
    let mut failed = Vec::new();
    for name in &names {
        if let Err(e) = manager.delete(name, &options).await {
            eprintln!("Error: {e}");
            failed.push(name.as_str());
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(CliError::Other {
            message: format!("failed to delete: {}", failed.join(", ")),
        })
    }
}
