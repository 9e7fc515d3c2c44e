// src/main.rs
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use revx::{templates::Template, RevxConfig, Router};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload, Registry};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[derive(Parser)]
#[command(name = "revx", version, about = "Development reverse proxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the reverse proxy server
    Start {
        #[arg(value_name = "CONFIG_FILE", default_value = "revx.yaml")]
        config: PathBuf,
        #[arg(long)]
        verbose: bool,
    },
    /// Validate a configuration file
    Validate {
        #[arg(value_name = "CONFIG_FILE")]
        config: PathBuf,
        #[arg(long)]
        verbose: bool,
    },
    /// Create a sample configuration file
    Init {
        /// Minimal API + frontend configuration
        #[arg(long)]
        simple: bool,
        /// Annotated reverse proxy configuration
        #[arg(long)]
        proxy: bool,
        #[arg(long, value_name = "FILE", default_value = "revx.yaml")]
        output: PathBuf,
        #[arg(long)]
        verbose: bool,
    },
}

impl Command {
    fn verbose(&self) -> bool {
        match self {
            Command::Start { verbose, .. }
            | Command::Validate { verbose, .. }
            | Command::Init { verbose, .. } => *verbose,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let filter = init_tracing(cli.command.verbose());

    let result = match cli.command {
        Command::Start { config, .. } => start(&config, &filter).await,
        Command::Validate {
            config, verbose, ..
        } => validate(&config, verbose),
        Command::Init {
            simple,
            proxy,
            output,
            ..
        } => init(&output, Template::from_flags(simple, proxy)),
    };

    if let Err(err) = result {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) -> FilterHandle {
    let default = if verbose { "debug" } else { "info,revx=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    handle
}

/// Apply `global.logging.level` unless `RUST_LOG` already decided.
fn apply_log_level(config: &RevxConfig, handle: &FilterHandle) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    if let Some(level) = &config.global.logging.level {
        let level = level.to_ascii_lowercase();
        if let Err(err) = handle.modify(|filter| *filter = EnvFilter::new(&level)) {
            warn!(error = %err, "Failed to apply logging level");
        }
    }
}

async fn start(path: &Path, filter: &FilterHandle) -> Result<()> {
    info!("Loading configuration from {}", path.display());
    let config = RevxConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    apply_log_level(&config, filter);

    Router::new(config).start().await?;
    Ok(())
}

fn validate(path: &Path, verbose: bool) -> Result<()> {
    info!("Validating configuration file: {}", path.display());
    let config = RevxConfig::from_file(path).context("Validation failed")?;

    info!("Configuration is valid");
    info!("  Server: {}:{}", config.server.host, config.server.port);
    info!("  Routes: {}", config.routes.len());

    if verbose {
        for (index, route) in config.routes.iter().enumerate() {
            info!("  {}. {}", index + 1, route.path);
            info!("     Target: {}", route.describe_target());
            if route.ws {
                info!("     WebSocket: enabled");
            }
            if route.health_check_enabled() {
                info!("     Health check: enabled");
            }
        }
    }
    Ok(())
}

fn init(output: &Path, template: Template) -> Result<()> {
    revx::templates::write_sample(output, template)
        .context("Failed to create configuration file (use --output to choose another name)")?;

    info!("Configuration file created: {}", output.display());
    info!("Edit the file to configure your routes");
    info!("Start the server with: revx start {}", output.display());
    Ok(())
}
