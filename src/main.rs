use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use socks_itm::{config, Interceptor};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "./config.toml".to_owned());
    let settings = config::init(&config_path)?;

    info!("starting services");
    let interceptor = Interceptor::start(settings).await?;

    tokio::signal::ctrl_c().await?;
    interceptor.close();

    info!("exiting");

    Ok(())
}
