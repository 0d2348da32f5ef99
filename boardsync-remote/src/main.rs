use anyhow::Result;
use clap::Parser;

use boardsync_remote::{config, log_bridge};

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let logs = match log_bridge::init() {
        Ok(logs) => Some(logs),
        Err(e) => {
            eprintln!("Failed to initialise logging: {}", e);
            None
        }
    };
    let cli = cli::Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let mut config = config::load_config(&config_path);
    config.apply_env();

    if let Some(logs) = logs {
        let log_path = config.log_path();
        match logs.attach_file(&log_path) {
            Ok(()) => log::info!("Logging to {}", log_path.display()),
            Err(e) => log::warn!("Cannot write log file {}: {}", log_path.display(), e),
        }
    }

    cli::run(cli, config, config_path).await
}
