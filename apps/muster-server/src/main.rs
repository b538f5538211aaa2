use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use musterkit_bootstrap::{AppConfig, CliArgs};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod app;
mod probes;
mod registered_modules;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Muster Server - runs a selected set of backend modules as one process
#[derive(Parser)]
#[command(name = "muster-server")]
#[command(about = "Muster Server - runs a selected set of backend modules as one process")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Module or group to run; repeatable (overrides runtime.target)
    #[arg(short, long = "target", global = true)]
    targets: Vec<String>,

    /// Pause between a termination signal and stopping the modules, e.g. "5s"
    #[arg(long, global = true, value_parser = humantime_serde::re::humantime::parse_duration)]
    shutdown_delay: Option<Duration>,

    /// Print effective configuration (YAML) and exit
    #[arg(long, global = true)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the selected modules
    Run,
    /// Validate configuration and the module graph, then exit
    Check,
    /// List the modules that can be selected as targets
    Modules,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        targets: cli.targets.clone(),
        shutdown_delay: cli.shutdown_delay,
        verbose: cli.verbose,
    };

    // Layered config:
    // 1) defaults -> 2) YAML (if provided) -> 3) env (MUSTER__*) -> 4) CLI overrides
    let mut config = AppConfig::load_layered(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    let logging_config = config.logging.clone().unwrap_or_default();
    let base_dir = cli
        .config
        .as_deref()
        .and_then(|p| p.parent())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    musterkit_bootstrap::init_logging(&logging_config, &base_dir);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(&config),
        Commands::Modules => list_modules(&config),
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    config.validate()?;
    tracing::info!(targets = ?config.runtime.target, "Muster Server starting");

    let runtime = app::Runtime::build(&config).await?;
    let result = runtime.run().await;
    match &result {
        Ok(()) => tracing::info!("Muster Server exited"),
        Err(e) => tracing::error!(error = %e, "Muster Server exited with failures"),
    }
    result
}

fn check_config(config: &AppConfig) -> Result<()> {
    tracing::info!("Checking configuration…");
    config.validate()?;

    let registry = registered_modules::build_registry(config, Arc::new(Vec::new))?;
    let order = registry.resolve(&config.runtime.target)?;
    registered_modules::check_run(config, &order)?;

    println!("Configuration is valid");
    println!("Modules in start order: {}", order.join(", "));
    Ok(())
}

fn list_modules(config: &AppConfig) -> Result<()> {
    let registry = registered_modules::build_registry(config, Arc::new(Vec::new))?;
    for name in registry.user_visible_module_names() {
        println!("{name}");
    }
    Ok(())
}
