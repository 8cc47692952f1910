pub mod config;
pub mod observer;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use config::Config;
use statistics::Monitor;

/// In order to let integration tests drive the binary's whole startup
/// path, the main function body lives here instead of in main.
pub async fn server_main(config: Arc<Config>) -> anyhow::Result<()> {
    let monitor = Monitor::default();
    let context = server::run(config, monitor.clone()).await?;

    tokio::signal::ctrl_c().await?;

    log::info!("shutting down: {:?}", monitor.snapshot());
    context.shutdown();
    Ok(())
}
