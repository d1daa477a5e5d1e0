//! Update command - modify an existing service in place

use clap::Args;
use knctl_kube::UpdateOptions;

use super::Context;
use crate::error::Result;
use crate::flags::{EditArgs, WaitArgs};

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Service name
    pub name: String,

    /// Attempts before giving up on conflicting updates
    #[arg(long, value_name = "N")]
    pub max_retries: Option<u32>,

    #[command(flatten)]
    pub edit: EditArgs,

    #[command(flatten)]
    pub wait: WaitArgs,
}

/// Run the update command
pub async fn run(ctx: &Context, args: &UpdateArgs) -> Result<()> {
    let defaults = &ctx.config.defaults;
    let edit = args.edit.parse(defaults)?;

    let mut options = UpdateOptions::new()
        .with_max_attempts(args.max_retries.unwrap_or(defaults.update_retries));
    if let Some(wait) = args.wait.config(defaults) {
        options = options.with_wait(wait);
    }

    let manager = ctx.manager().await?;
    manager.update(&args.name, &edit, &options).await?;
    Ok(())
}
