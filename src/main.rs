use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use archipelago::islands::driver::{spawn_driver, DriverConfig};
use archipelago::islands::publisher::{LineSink, UpdatePublisher};
use archipelago::islands::transport::P2pTransport;
use archipelago::islands::wire::InboundEvent;
use archipelago::islands::{ArchipelagoConfig, IslandEngine};

/// Reads peer events as JSON lines on stdin and writes outbound messages as
/// JSON lines on stdout.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ArchipelagoConfig::from_env()?;
    info!(
        join_distance = config.join_distance,
        leave_distance = config.leave_distance,
        prefix = %config.room_prefix,
        "archipelago starting"
    );

    if let Some(addr) = config.metrics_addr {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;
        info!(%addr, "prometheus exporter listening");
    }

    let mut engine = IslandEngine::new(config.engine_options());
    engine.on_transport_heartbeat(
        P2pTransport::info(config.p2p_max_island_size),
        Arc::new(P2pTransport),
    );

    let publisher = UpdatePublisher::new(Arc::new(LineSink::new(tokio::io::stdout())), config.commit_hash.clone());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let (handle, driver) = spawn_driver(engine, publisher, DriverConfig::from(&config), shutdown_rx);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<InboundEvent>(&line) {
                    Ok(event) => handle.apply(event).await?,
                    Err(err) => warn!(error = %err, "dropping malformed event"),
                }
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    // Publish whatever is still buffered before stopping.
    handle.flush().await?;
    let _ = shutdown_tx.send(());
    driver.await?;
    Ok(())
}
