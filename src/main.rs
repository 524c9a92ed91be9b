//! Cairn CLI entry point
//!
//! Loads configuration, sets up logging, and dispatches to subcommands.

use cairn::cli::{Cli, Commands};
use cairn::config::{Config, ConfigManager};
use cairn::error::{CairnError, CairnResult};
use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> CairnResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    let local_config_path = if cli.no_local {
        None
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| CairnError::io("getting current directory", e))?;
        ConfigManager::find_local_config(&cwd)
    };

    let config = config_manager
        .load_merged(local_config_path.as_deref())
        .await?;

    init_logging(cli.verbose, &config);
    match local_config_path {
        Some(ref path) => debug!("Using local config: {}", path.display()),
        None if cli.no_local => debug!("Local config discovery disabled (--no-local)"),
        None => {}
    }

    ConfigManager::ensure_state_dirs(&config).await?;

    match cli.command {
        Commands::Lock(args) => cairn::cli::commands::lock(args, &config).await,
        Commands::Digest(args) => cairn::cli::commands::digest(args, &config).await,
        Commands::Cache(args) => cairn::cli::commands::cache(args, &config).await,
        Commands::Config(args) => {
            cairn::cli::commands::config(args, &config, &config_manager).await
        }
    }
}

/// 0 = warn, 1 = info, 2+ = debug; `general.verbose` counts as one `-v`
fn init_logging(verbose: u8, config: &Config) {
    let level = verbose.max(u8::from(config.general.verbose));
    let filter = match level {
        0 => EnvFilter::new("cairn=warn"),
        1 => EnvFilter::new("cairn=info"),
        _ => EnvFilter::new("cairn=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
