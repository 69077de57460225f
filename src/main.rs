//! Parley - OpenAI-compatible gateway for a session-based chat upstream

use clap::{Parser, Subcommand};
use parley::{config, Server, NAME, VERSION};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Parley - OpenAI-compatible chat gateway
#[derive(Parser)]
#[command(name = NAME)]
#[command(version = VERSION)]
#[command(about = "OpenAI-compatible gateway for a session-based streaming chat service")]
#[command(
    long_about = "Parley exposes /v1/chat/completions and /v1/models, negotiates a \
    session with the upstream chat service for every call, shares one rate limit \
    across all local processes, and emulates tool calling through prompting.\n\n\
    Optional features (compile with --features flag):\n  \
    - distributed-rate-limit: share rate-limit state across hosts through Redis"
)]
struct Cli {
    /// Configuration file path (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, json, compact)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Run,

    /// Validate configuration file
    Validate,

    /// Show the effective configuration
    Config,

    /// List the advertised models
    Models,
}

#[tokio::main]
async fn main() -> parley::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, &cli.log_format)?;

    let config_path = cli.config.as_deref();
    match cli.command {
        Some(Commands::Validate) => validate_config(config_path),
        Some(Commands::Config) => show_config(config_path),
        Some(Commands::Models) => show_models(config_path),
        Some(Commands::Run) | None => run_server(config_path).await,
    }
}

/// Initialize logging based on configuration
fn init_logging(level: &str, format: &str) -> parley::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("parley={},hyper=warn", level)));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

async fn run_server(config_path: Option<&Path>) -> parley::Result<()> {
    info!("Starting {} v{}", NAME, VERSION);

    let config = config::load_or_default(config_path)?;
    match config_path {
        Some(path) => info!("Configuration loaded from {:?}", path),
        None => info!("No configuration file given, using defaults"),
    }

    let server = Server::new(config).await?;
    server.run().await
}

/// Validate configuration file
fn validate_config(config_path: Option<&Path>) -> parley::Result<()> {
    match config_path {
        Some(path) => println!("Validating configuration: {:?}", path),
        None => println!("Validating default configuration"),
    }

    match config::load_or_default(config_path) {
        Ok(config) => {
            println!("\n\u{2713} Configuration is valid!");
            println!("\nSummary:");
            println!("  Listen: {}", config.server.listen);
            println!("  Status URL: {}", config.upstream.status_url);
            println!("  Chat URL: {}", config.upstream.chat_url);
            println!(
                "  Rate limit: {} requests / {}, min interval {}",
                config.rate_limit.max_requests,
                humantime::format_duration(config.rate_limit.window),
                humantime::format_duration(config.rate_limit.min_interval),
            );
            println!("  Rate limit backend: {:?}", config.rate_limit.backend);
            println!(
                "  Models: {} (default {})",
                config.models.catalog.len(),
                config.models.default_model
            );
            Ok(())
        }
        Err(e) => {
            println!("\n\u{2717} Configuration is invalid!");
            println!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Show the effective configuration as YAML
fn show_config(config_path: Option<&Path>) -> parley::Result<()> {
    let config = config::load_or_default(config_path)?;

    let yaml =
        serde_yaml::to_string(&config).map_err(|e| parley::ParleyError::Config(e.to_string()))?;

    println!("{}", yaml);
    Ok(())
}

/// Print the model catalog
fn show_models(config_path: Option<&Path>) -> parley::Result<()> {
    let config = config::load_or_default(config_path)?;
    let catalog = parley::llm::ModelCatalog::new(&config.models);

    let width = catalog
        .list()
        .data
        .iter()
        .map(|m| m.id.len())
        .max()
        .unwrap_or(0);
    for entry in &config.models.catalog {
        let marker = if entry.id == config.models.default_model {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<width$}  -> {}  ({})",
            marker,
            entry.id,
            entry.upstream_id(),
            entry.owned_by,
            width = width
        );
    }
    Ok(())
}
