use anyhow::{Context, Result};
use tracing::info;

use crate::{app::App, config::AppConfig};

use super::check::check_config;
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run { config } => {
            run(config).await?;
        }
        Commands::Check { config, format } => {
            check_config(config, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
    }

    Ok(())
}

/// 运行直到 Ctrl+C，然后关闭所有入站
async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let config = AppConfig::load(config_path)?;

    let app = App::from_config(&config).context("Failed to build dispatcher")?;
    app.start().await.context("Failed to start inbounds")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down");

    app.close().await;
    for stats in app.stats().get_all_inbound_stats() {
        info!(
            "[{}] {} flow(s), {} rejected, {} bytes up, {} bytes down",
            stats.tag, stats.total_connections, stats.rejected_connections, stats.uplink_bytes, stats.downlink_bytes
        );
    }
    Ok(())
}
