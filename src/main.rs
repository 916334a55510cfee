use anyhow::Result;
use route_throttle::config::Config;
use route_throttle::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("route_throttle={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting route-throttle gateway");
    tracing::info!(
        "Configuration: bind_addr={}, store_capacity={}, store_ttl_secs={}, rules_file={:?}",
        config.bind_addr,
        config.store_capacity,
        config.store_ttl_secs,
        config.rules_file
    );

    let server = Server::new(&config)
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
