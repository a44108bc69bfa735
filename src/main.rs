mod analyze;
mod cli;
mod config;
mod delete;
mod job;
mod jobs;
mod progress;
mod report;
mod tui;
mod upgrade;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use config::{Config, Settings};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    init_tracing(config.log.as_deref());
    let settings = Settings::resolve(&cli, config)?;

    match &cli.command {
        Command::Analyze(args) => analyze::run(args, &settings)?,
        Command::Delete(args) => delete::run(args, &settings)?,
        Command::Report(args) => report::run(args, &settings)?,
        Command::DropTree(args) => jobs::drop_tree(args, &settings)?,
        Command::SetHosts(args) => jobs::set_hosts(args, &settings)?,
        Command::ExportCache(args) => jobs::export(args, &settings)?,
        Command::ImportCache(args) => jobs::import(args, &settings)?,
        Command::ListJobs => jobs::list(&settings)?,
        Command::UpgradeCache(args) => upgrade::run(args, &settings)?,
    }

    Ok(())
}

/// Logs go to stderr; RUST_LOG wins over the config's `log` directive.
fn init_tracing(directive: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive.unwrap_or("warn")))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
