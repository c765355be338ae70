//! Chat relay - Main entry point.

use anyhow::Result;
use relay_channels::start_server;
use relay_common::config::Config;
use relay_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (file + environment), rejecting invalid limits
    let config = Config::load_and_validate()?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Chat relay v{}", env!("CARGO_PKG_VERSION"));

    start_server(&config).await
}
