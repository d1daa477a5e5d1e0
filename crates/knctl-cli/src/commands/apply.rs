//! Apply command - converge a service on the flags given

use clap::Args;
use knctl_kube::ApplyOptions;

use super::Context;
use crate::error::Result;
use crate::flags::{EditArgs, WaitArgs};

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Service name
    pub name: String,

    #[command(flatten)]
    pub edit: EditArgs,

    #[command(flatten)]
    pub wait: WaitArgs,
}

/// Run the apply command
pub async fn run(ctx: &Context, args: &ApplyArgs) -> Result<()> {
    let defaults = &ctx.config.defaults;
    let edit = args.edit.parse(defaults)?;

    let mut options = ApplyOptions::new();
    if let Some(wait) = args.wait.config(defaults) {
        options = options.with_wait(wait);
    }

    let manager = ctx.manager().await?;
    let outcome = manager.apply(&args.name, &edit, &options).await?;
    tracing::debug!(name = %args.name, needs_wait = outcome.needs_wait(), "apply finished");
    Ok(())
}
