pub mod api;
pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod model;
pub mod mqtt;
pub mod registry;
pub mod router;
pub mod store;

#[cfg(test)]
mod testing;

use crate::bridge::{Bridge, BridgeHandle};
use crate::config::BridgeConfig;
use color_eyre::{eyre::eyre, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = BridgeConfig::load()?;
    setup_logging(&config.logging.level)?;
    info!(
        "Starting gasbridge {} (broker {}, HTTP {})",
        env!("CARGO_PKG_VERSION"),
        config.broker.address(),
        config.http.bind
    );

    let bind_addr = config.bind_addr()?;
    let bridge = Bridge::configure(config)
        .connect()
        .await
        .map_err(|e| eyre!("Failed to start bridge: {}", e))?;
    info!("Broker connection {:?}", bridge.connection_state());

    let mut handle = BridgeHandle::spawn(bridge)?;

    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| eyre!("Failed to bind HTTP listener on {}: {}", bind_addr, e))?;
    info!("HTTP API listening on {}", bind_addr);

    let served = axum::serve(listener, api::router(handle.services()))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = &served {
        warn!("HTTP server stopped with error: {}", e);
    }

    handle.shutdown().await?;
    served?;
    info!("gasbridge stopped");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

/// `RUST_LOG` wins over the configured level
fn setup_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| eyre!("Invalid log level {:?}: {}", level, e))?;

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-C received, shutting down"),
        Err(e) => {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await
        }
    }
}
