//! List command - list services

use clap::Args;
use knctl_kube::ListFilter;

use super::Context;
use crate::display;
use crate::error::Result;
use crate::flags::OutputArgs;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only show the service with this name
    pub name: Option<String>,

    /// List services in all namespaces
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    /// Label selector (KEY=VALUE or KEY, comma separated)
    #[arg(short = 'l', long = "label", value_name = "SELECTOR")]
    pub label: Option<String>,

    #[command(flatten)]
    pub output: OutputArgs,
}

impl ListArgs {
    pub fn filter(&self) -> ListFilter {
        let mut filter = ListFilter::new();
        if let Some(name) = &self.name {
            filter = filter.with_name(name);
        }
        if let Some(label) = &self.label {
            filter = filter.with_labels(label);
        }
        if self.all_namespaces {
            filter = filter.all_namespaces();
        }
        filter
    }
}

/// Run the list command
pub async fn run(ctx: &Context, args: &ListArgs) -> Result<()> {
    let format = args.output.format()?;
    let gateway = ctx.gateway().await?;
    let services = gateway.list_services(&args.filter()).await?;
    display::print_services(&services, format, args.all_namespaces)
}
