//! order-reserver: order-update ingestion service
//!
//! Consumes order updates from the queue and keeps one snapshot per session
//! in object storage. Also serves the synchronous HTTP ingress.
//!
//! ## Architecture
//! ```text
//! [Queue] -> [QueueIngestor] ----+
//!                                +--> [SnapshotWriter] -> [ObjectStore]
//! [HTTP :7071] -> [DirectEndpoint]+
//! ```
//!
//! ## Configuration
//! - `--config <path>` or RESERVER_CONFIG: YAML configuration file
//! - RESERVER__SECTION__KEY: overrides, e.g. RESERVER__STORAGE__CONTAINER
//! - BLOB_CONNECTION_STRING, BLOB_CONTAINER_NAME, SERVICEBUS_CONNECTION_STRING,
//!   SERVICEBUS_QUEUE_NAME: legacy variables, used for unset values
//! - RESERVER_LOG: log filter (default: info)

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use order_reserver::config::Config;
use order_reserver::handlers::direct::serve;
use order_reserver::handlers::{DirectEndpoint, QueueIngestor};
use order_reserver::queue::init_queue;
use order_reserver::store::init_snapshot_target;
use order_reserver::utils::bootstrap::{cancel_on_ctrl_c, init_tracing, parse_config_path};
use order_reserver::utils::retry::RetryPolicy;
use order_reserver::writer::SnapshotWriter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let target = init_snapshot_target(&config.storage)
        .await
        .map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let policy = RetryPolicy::from(&config.retry);
    let writer = target.map(|target| {
        info!(
            container = %target.container(),
            strategy = ?target.strategy(),
            max_attempts = policy.max_attempts,
            delay_ms = policy.delay.as_millis() as u64,
            "Snapshot writer ready"
        );
        Arc::new(
            SnapshotWriter::new(target)
                .with_policy(policy)
                .with_shutdown(shutdown.clone()),
        )
    });

    let queue = init_queue(&config.queue, shutdown.clone()).await?;
    queue
        .subscribe(Arc::new(QueueIngestor::new(writer.clone())))
        .await?;
    info!(queue = %config.queue.name, "Consuming order updates");

    let endpoint =
        Arc::new(DirectEndpoint::new(writer).with_retry(config.server.direct_retry));
    serve(
        endpoint,
        &config.server.host,
        config.server.port,
        shutdown.clone(),
    )
    .await
    .map_err(|e| -> Box<dyn std::error::Error> { e })?;

    info!("order-reserver stopped");
    Ok(())
}
