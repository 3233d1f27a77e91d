use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use playtime_cli::commands::{reset, serve, status};
use playtime_cli::{Cli, Commands, Config};
use playtime_core::UserId;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Logs go to stderr; stdout carries host commands in `serve`.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let config = Config::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    let today = Utc::now().date_naive();
    let mut stdout = std::io::stdout();

    match &cli.command {
        Some(Commands::Serve) => serve::run(&config)?,
        Some(Commands::Status { json }) => status::run(&mut stdout, &config, today, *json)?,
        Some(Commands::Reset { user }) => {
            reset::run(&mut stdout, &config, &UserId::new(user.as_str()), today)?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
