//! Describe command - show a service with its revisions and conditions

use chrono::Utc;
use clap::Args;

use super::Context;
use crate::display;
use crate::error::Result;
use crate::flags::OutputArgs;

#[derive(Args, Debug)]
pub struct DescribeArgs {
    /// Service name
    pub name: String,

    #[command(flatten)]
    pub output: OutputArgs,
}

/// Run the describe command
pub async fn run(ctx: &Context, args: &DescribeArgs) -> Result<()> {
    let format = args.output.format()?;
    let manager = ctx.manager().await?;
    let description = manager.describe(&args.name).await?;

    if format.is_machine() {
        return display::print_object(&description.service, format);
    }
    print!("{}", display::describe_service(&description, Utc::now()));
    Ok(())
}
