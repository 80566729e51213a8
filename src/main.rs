use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use traffic_dispatch::cli::{execute_command, Cli, Commands};
use traffic_dispatch::config::AppConfig;

/// 日志级别优先级：RUST_LOG > --log-level > 配置文件 log.level > info
fn resolve_log_level(cli: &Cli) -> String {
    if let Some(ref level) = cli.log_level {
        return level.clone();
    }
    if let Commands::Run { config } = &cli.command {
        // 配置错误在加载时再报告，这里只取日志级别
        if let Ok(content) = std::fs::read_to_string(config) {
            if let Ok(app) = toml::from_str::<AppConfig>(&content) {
                if let Some(level) = app.log.level {
                    return level;
                }
            }
        }
    }
    "info".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(resolve_log_level(&cli)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    if matches!(cli.command, Commands::Run { .. }) {
        info!("Traffic Dispatch v{}", env!("CARGO_PKG_VERSION"));
    }

    execute_command(&cli).await
}
