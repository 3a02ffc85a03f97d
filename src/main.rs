use anyhow::Result;
use tracing::info;
use zephyr_runner::config::RunnerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting Zephyr application build runner");

    let config = RunnerConfig::from_env();
    if !config.tool_search_paths.is_empty() {
        info!("Tool search paths: {:?}", config.tool_search_paths);
    }

    zephyr_runner::server::run_server(config).await?;

    Ok(())
}
