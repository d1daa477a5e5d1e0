//! Import command - recreate a service from an export document

use std::path::PathBuf;

use clap::Args;
use knctl_core::Export;
use knctl_kube::ImportOptions;

use super::Context;
use crate::error::{CliError, Result};
use crate::flags::WaitArgs;

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Export document (YAML or JSON)
    pub file: PathBuf,

    #[command(flatten)]
    pub wait: WaitArgs,
}

/// Run the import command
pub async fn run(ctx: &Context, args: &ImportArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.file).map_err(|e| CliError::Io {
        message: format!("{}: {e}", args.file.display()),
    })?;
    let export = Export::parse(&text)?;

    let mut options = ImportOptions::new();
    if let Some(wait) = args.wait.config(&ctx.config.defaults) {
        options = options.with_wait(wait);
    }

    let manager = ctx.manager().await?;
    manager.import(&export, &options).await?;
    Ok(())
}
