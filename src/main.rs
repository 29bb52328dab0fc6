use anyhow::{Context, Result};
use clap::Parser;
use wa_gateway_sync::config::Config;
use wa_gateway_sync::{cli, logging};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file before anything else (silently ignore if missing)
    dotenvy::dotenv().ok();

    let cli_args = cli::Cli::parse();

    // Configuration decides the log level, so it is read before logging
    // starts. `init` creates the file and must not require it.
    let config = match cli_args.command {
        Some(cli::Commands::Init { .. }) => Config::default(),
        _ => cli::load_config(cli_args.config.as_deref())?,
    };

    let mut log_config = logging::LogConfig::new()
        .with_level(config.logging.level.clone())
        .with_log_file(config.logging.file.clone())
        .with_debug_mode(cli_args.debug);

    // Custom log directory from env
    if let Ok(log_dir) = std::env::var("DEBUG_LOGS_LOCATION") {
        log_config = log_config.with_log_dir(std::path::PathBuf::from(log_dir));
    }

    let _guard = logging::init_logging(log_config).context("Failed to initialize logging")?;

    // Clean up old log files (keep last 7 days)
    if cli_args.debug
        && let Ok(removed) = logging::cleanup_old_logs(7)
        && removed > 0
    {
        tracing::info!("Cleaned up {} old log file(s)", removed);
    }

    cli::run(cli_args, config).await
}
