//! fleetgate - HTTP server entry point.

use fleetgate::{api, Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetgate=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    info!(
        host = %config.host,
        port = config.port,
        algorithm = ?config.load_balancer.algorithm,
        "Loaded configuration"
    );

    api::serve(config).await?;

    Ok(())
}
