//! replica-projector: projection consumer
//!
//! Consumes replicated domain events from AMQP and applies them to the
//! local projection store.
//!
//! ## Architecture
//! ```text
//! [AMQP queues] -> [replica-projector] -> [Projection store]
//! ```
//!
//! ## Configuration
//! - First argument or REPLICA_CONFIG: YAML configuration file
//! - REPLICA__MESSAGING__URL etc.: environment overrides
//! - REPLICA_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use replica::bus::{AmqpConnector, ConnectionSupervisor, EventConsumer, Role};
use replica::config::Config;
use replica::projection::ProjectionApplier;
use replica::storage::init_storage;
use replica::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(service = %config.service, "Starting replica-projector");

    if config.subscriptions.is_empty() {
        return Err("replica-projector requires at least one subscription".into());
    }

    let store = init_storage(&config.storage).await?;
    let catalog = config.catalog();
    info!(entities = ?catalog.entities().collect::<Vec<_>>(), "Projection catalog loaded");
    let applier = Arc::new(ProjectionApplier::new(store, Arc::new(catalog)));

    let supervisor = Arc::new(
        ConnectionSupervisor::new(
            config.service.as_str(),
            Role::Consume,
            config.messaging.url.as_str(),
            Arc::new(AmqpConnector::new(config.messaging.max_in_flight)),
        )
        .with_policy(config.messaging.reconnect.policy())
        .with_topology(config.topology.clone()),
    );
    supervisor.start().await.map_err(|e| {
        error!("Failed to start broker connection: {}", e);
        e
    })?;

    let consumers: Vec<_> = config
        .subscriptions
        .iter()
        .map(|subscription| {
            info!(queue = %subscription.queue, prefetch = subscription.prefetch, "Subscribing");
            EventConsumer::subscribe(supervisor.clone(), subscription.clone(), applier.handlers())
        })
        .collect();

    shutdown_signal().await;

    for consumer in consumers {
        let queue = consumer.queue().to_string();
        let stats = consumer.stats();
        consumer.shutdown().await;
        info!(
            queue = %queue,
            acked = stats.acked(),
            requeued = stats.requeued(),
            dropped = stats.dropped(),
            "Consumer stopped"
        );
    }
    supervisor.shutdown().await;

    info!("replica-projector stopped");
    Ok(())
}
