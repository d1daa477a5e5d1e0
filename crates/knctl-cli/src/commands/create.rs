//! Create command - create a service, or replace it with --force

use clap::Args;
use knctl_kube::CreateOptions;

use super::Context;
use crate::error::Result;
use crate::flags::{EditArgs, WaitArgs};

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Service name
    pub name: String,

    /// Replace the service if it already exists
    #[arg(long)]
    pub force: bool,

    #[command(flatten)]
    pub edit: EditArgs,

    #[command(flatten)]
    pub wait: WaitArgs,
}

/// Run the create command
pub async fn run(ctx: &Context, args: &CreateArgs) -> Result<()> {
    let defaults = &ctx.config.defaults;
    let edit = args.edit.parse(defaults)?;

    let mut options = CreateOptions::new();
    if args.force {
        options = options.with_force();
    }
    if let Some(wait) = args.wait.config(defaults) {
        options = options.with_wait(wait);
    }

    let manager = ctx.manager().await?;
    manager.create(&args.name, &edit, &options).await?;
    Ok(())
}
