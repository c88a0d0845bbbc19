// Shield privacy pipeline
// Main entry point for the shield binary

use clap::Parser;
use shield_engine::cli::{Cli, Command};
use shield_engine::config::Config;
use shield_engine::handlers::{handle_plan, handle_run, handle_tools, OutputFormat};
use shield_engine::pipeline::Shield;
use shield_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // RUST_LOG still wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);
    tracing::info!("Shield v{}", env!("CARGO_PKG_VERSION"));

    let shield = Shield::new(config)?;

    match cli.command {
        Command::Run { request, input } => {
            tracing::info!(request = %request, "Running request");
            handle_run(&shield, &request, &input, format).await
        }
        Command::Plan { request } => handle_plan(&shield, &request, format).await,
        Command::Tools => handle_tools(&shield, format),
    }
}
