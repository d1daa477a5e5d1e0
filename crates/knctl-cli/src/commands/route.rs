//! Route commands - inspect the routes of services

use clap::{Args, Subcommand};
use knctl_kube::ListFilter;

use super::Context;
use crate::display;
use crate::error::Result;
use crate::flags::OutputArgs;

#[derive(Subcommand, Debug)]
pub enum RouteCommand {
    /// List routes
    List(RouteListArgs),

    /// Show the traffic targets of a route
    Describe(RouteDescribeArgs),
}

#[derive(Args, Debug)]
pub struct RouteListArgs {
    /// Only show the route with this name
    pub name: Option<String>,

    /// List routes in all namespaces
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug)]
pub struct RouteDescribeArgs {
    /// Route name
    pub name: String,

    #[command(flatten)]
    pub output: OutputArgs,
}

pub async fn run(ctx: &Context, command: &RouteCommand) -> Result<()> {
    let gateway = ctx.gateway().await?;
    match command {
        RouteCommand::List(args) => {
            let format = args.output.format()?;
            let mut filter = ListFilter::new();
            if let Some(name) = &args.name {
                filter = filter.with_name(name);
            }
            if args.all_namespaces {
                filter = filter.all_namespaces();
            }
            let routes = gateway.list_routes(&filter).await?;
            display::print_routes(&routes, format, args.all_namespaces)
        }
        RouteCommand::Describe(args) => {
            let format = args.output.format()?;
            let route = gateway.get_route(&args.name).await?;
            if format.is_machine() {
                return display::print_object(&route, format);
            }

            let status = route.status.as_ref();
            println!("Name:       {}", args.name);
            println!(
                "Namespace:  {}",
                route.metadata.namespace.as_deref().unwrap_or_default()
            );
            println!(
                "URL:        {}",
                status.and_then(|s| s.url.as_deref()).unwrap_or_default()
            );
            println!("Traffic:");
            let targets = match status {
                Some(s) if !s.traffic.is_empty() => &s.traffic,
                _ => &route.spec.traffic,
            };
            for target in targets {
                let revision = match (&target.revision_name, target.is_latest()) {
                    (Some(name), true) => format!("@latest ({name})"),
                    (Some(name), false) => name.clone(),
                    (None, _) => "@latest".to_string(),
                };
                let tag = target
                    .tag
                    .as_deref()
                    .map(|t| format!(" #{t}"))
                    .unwrap_or_default();
                println!("  {:>4}  {revision}{tag}", format!("{}%", target.percent_or_zero()));
            }
            Ok(())
        }
    }
}
