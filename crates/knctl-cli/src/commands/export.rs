//! Export command - print a service, optionally with its routed revisions

use std::path::PathBuf;

use clap::Args;
use knctl_core::export::service_to_value;

use super::Context;
use crate::display;
use crate::error::Result;
use crate::flags::{OutputArgs, OutputFormat};

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Service name
    pub name: String,

    /// Include the revisions the service routes traffic to
    #[arg(long)]
    pub with_revisions: bool,

    /// Write to a file instead of stdout
    #[arg(long, value_name = "PATH")]
    pub output_file: Option<PathBuf>,

    #[command(flatten)]
    pub output: OutputArgs,
}

/// Run the export command
pub async fn run(ctx: &Context, args: &ExportArgs) -> Result<()> {
    let format = match args.output.format()? {
        OutputFormat::Json => OutputFormat::Json,
        _ => OutputFormat::Yaml,
    };

    let manager = ctx.manager().await?;
    let export = manager.export(&args.name, args.with_revisions).await?;
    let value = if args.with_revisions {
        export.to_value()?
    } else {
        service_to_value(&export.spec.service)?
    };
    let text = display::render_object(&value, format)?;

    match &args.output_file {
        Some(path) => {
            std::fs::write(path, text)?;
            display::success(&format!(
                "Exported service '{}' to {}",
                args.name,
                path.display()
            ));
        }
        None => print!("{text}"),
    }
    Ok(())
}
