//! Revision commands - list, describe and delete revisions

use std::time::Duration;

use chrono::Utc;
use clap::{Args, Subcommand};
use knctl_core::resources::{Conditioned, Revision};
use knctl_kube::ListFilter;

use super::Context;
use crate::display;
use crate::error::Result;
use crate::flags::OutputArgs;

#[derive(Subcommand, Debug)]
pub enum RevisionCommand {
    /// List revisions
    List(RevisionListArgs),

    /// Show details of a revision
    Describe(RevisionDescribeArgs),

    /// Delete revisions
    Delete(RevisionDeleteArgs),
}

#[derive(Args, Debug)]
pub struct RevisionListArgs {
    /// Only show the revision with this name
    pub name: Option<String>,

    /// Only show revisions of this service
    #[arg(short = 's', long)]
    pub service: Option<String>,

    /// List revisions in all namespaces
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug)]
pub struct RevisionDescribeArgs {
    /// Revision name
    pub name: String,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug)]
pub struct RevisionDeleteArgs {
    /// Revisions to delete
    #[arg(required = true)]
    pub names: Vec<String>,
}

pub async fn run(ctx: &Context, command: &RevisionCommand) -> Result<()> {
    match command {
        RevisionCommand::List(args) => list(ctx, args).await,
        RevisionCommand::Describe(args) => describe(ctx, args).await,
        RevisionCommand::Delete(args) => delete(ctx, args).await,
    }
}

/// Order by service, newest generation first
pub fn sort_for_display(revisions: &mut [Revision]) {
    revisions.sort_by(|a, b| {
        (a.metadata.namespace.as_deref(), a.service_name())
            .cmp(&(b.metadata.namespace.as_deref(), b.service_name()))
            .then_with(|| b.configuration_generation().cmp(&a.configuration_generation()))
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
}

async fn list(ctx: &Context, args: &RevisionListArgs) -> Result<()> {
    let format = args.output.format()?;
    let gateway = ctx.gateway().await?;

    let mut filter = ListFilter::new();
    if let Some(name) = &args.name {
        filter = filter.with_name(name);
    }
    if let Some(service) = &args.service {
        filter = filter.with_service(service);
    }
    if args.all_namespaces {
        filter = filter.all_namespaces();
    }
    let mut revisions = gateway.list_revisions(&filter).await?;
    sort_for_display(&mut revisions);

    let mut service_filter = ListFilter::new();
    if args.all_namespaces {
        service_filter = service_filter.all_namespaces();
    }
    let services = gateway.list_services(&service_filter).await?;
    display::print_revisions(&revisions, &services, format, args.all_namespaces)
}

async fn describe(ctx: &Context, args: &RevisionDescribeArgs) -> Result<()> {
    let format = args.output.format()?;
    let gateway = ctx.gateway().await?;
    let revision = gateway.get_revision(&args.name).await?;
    if format.is_machine() {
        return display::print_object(&revision, format);
    }

    let now = Utc::now();
    println!("Name:        {}", args.name);
    println!(
        "Namespace:   {}",
        revision.metadata.namespace.as_deref().unwrap_or_default()
    );
    println!("Service:     {}", revision.service_name().unwrap_or_default());
    println!("Generation:  {}", revision.configuration_generation());
    println!("Age:         {}", display::age(&revision.metadata, now));
    if let Some(image) = revision.image() {
        match revision.image_digest() {
            Some(digest) if digest != image => println!("Image:       {image} ({digest})"),
            _ => println!("Image:       {image}"),
        }
    }
    let (ready, reason) = display::ready_columns(&revision);
    println!("Ready:       {ready} {reason}");
    println!("Conditions:  {}", display::condition_summary(&revision));
    for condition in revision.conditions() {
        println!(
            "  {:<24} {:<8} {}",
            condition.type_,
            condition.status,
            condition.message.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}

async fn delete(ctx: &Context, args: &RevisionDeleteArgs) -> Result<()> {
    let gateway = ctx.gateway().await?;
    for name in &args.names {
        gateway.delete_revision(name, Duration::ZERO).await?;
        println!(
            "Revision '{name}' deleted in namespace '{}'.",
            gateway.namespace()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn revision(name: &str, service: &str, generation: u32) -> Revision {
        let mut revision = Revision::new(name, Default::default());
        revision.metadata.labels = Some(BTreeMap::from([
            ("serving.knative.dev/service".to_string(), service.to_string()),
            (
                "serving.knative.dev/configurationGeneration".to_string(),
                generation.to_string(),
            ),
        ]));
        revision
    }

    #[test]
    fn test_sort_for_display() {
        let mut revisions = vec![
            revision("foo-1", "foo", 1),
            revision("bar-1", "bar", 1),
            revision("foo-3", "foo", 3),
            revision("foo-2", "foo", 2),
        ];
        sort_for_display(&mut revisions);
        let names: Vec<_> = revisions
            .iter()
            .map(|r| r.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["bar-1", "foo-3", "foo-2", "foo-1"]);
    }
}
