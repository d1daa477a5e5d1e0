//! knctl - manage Knative services from the command line

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod display;
mod error;
mod exit_codes;
mod flags;

use commands::revision::RevisionCommand;
use commands::route::RouteCommand;
use commands::{Context, GlobalArgs};
use config::Config;
use error::Result;

#[derive(Parser)]
#[command(name = "knctl")]
#[command(version)]
#[command(about = "Manage Knative services, revisions and routes", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage services
    #[command(subcommand, visible_alias = "ksvc")]
    Service(ServiceCommand),

    /// Inspect and delete revisions
    #[command(subcommand)]
    Revision(RevisionCommand),

    /// Inspect routes
    #[command(subcommand)]
    Route(RouteCommand),
}

#[derive(Subcommand)]
enum ServiceCommand {
    /// Create a service
    Create(commands::create::CreateArgs),

    /// Update a service
    Update(commands::update::UpdateArgs),

    /// Create or update a service declaratively
    Apply(commands::apply::ApplyArgs),

    /// Delete services
    Delete(commands::delete::DeleteArgs),

    /// Show details of a service
    Describe(commands::describe::DescribeArgs),

    /// List services
    List(commands::list::ListArgs),

    /// Export a service, optionally with its revisions
    Export(commands::export::ExportArgs),

    /// Import a service from an export file
    Import(commands::import::ImportArgs),

    /// Copy a service with its revisions to another namespace or cluster
    Migrate(commands::migrate::MigrateArgs),
}

#[tokio::main]
async fn main() {
    miette::set_panic_hook();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::USAGE_ERROR
            } else {
                exit_codes::SUCCESS
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    init_colors();
    init_logging(&cli.global.log_level);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_colors() {
    if std::env::var_os("NO_COLOR").is_some() {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    } else if std::env::var_os("FORCE_COLOR").is_some() {
        console::set_colors_enabled(true);
        console::set_colors_enabled_stderr(true);
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");
    let ctx = Context::new(cli.global, config);

    match &cli.command {
        Commands::Service(command) => match command {
            ServiceCommand::Create(args) => commands::create::run(&ctx, args).await,
            ServiceCommand::Update(args) => commands::update::run(&ctx, args).await,
            ServiceCommand::Apply(args) => commands::apply::run(&ctx, args).await,
            ServiceCommand::Delete(args) => commands::delete::run(&ctx, args).await,
            ServiceCommand::Describe(args) => commands::describe::run(&ctx, args).await,
            ServiceCommand::List(args) => commands::list::run(&ctx, args).await,
            ServiceCommand::Export(args) => commands::export::run(&ctx, args).await,
            ServiceCommand::Import(args) => commands::import::run(&ctx, args).await,
            ServiceCommand::Migrate(args) => commands::migrate::run(&ctx, args).await,
        },
        Commands::Revision(command) => commands::revision::run(&ctx, command).await,
        Commands::Route(command) => commands::route::run(&ctx, command).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_service_alias() {
        let cli = Cli::try_parse_from(["knctl", "ksvc", "list", "-n", "dev"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Service(ServiceCommand::List(_))
        ));
        assert_eq!(cli.global.namespace.as_deref(), Some("dev"));
    }

    #[test]
    fn test_conflicting_flags_rejected() {
        let result = Cli::try_parse_from([
            "knctl",
            "service",
            "create",
            "foo",
            "--image",
            "img",
            "--cluster-local",
            "--no-cluster-local",
        ]);
        assert!(result.is_err());
    }
}
