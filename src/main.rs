// src/main.rs
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use rabbitmq_adapter::config;
use rabbitmq_adapter::env::Settings;
use rabbitmq_adapter::rabbitmq::{
    handler_fn, BoxError, ConnectionManager, Consumer, ConsumerConfig, Delivery, Producer,
    ProducerConfig, RabbitMQError, TopologyDeclarator, TopologySpec,
};

#[derive(Debug, Serialize, Deserialize)]
struct OrderCreated {
    order_id: String,
    customer_id: String,
    items: Vec<String>,
    total: f64,
    timestamp: DateTime<Utc>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::load().context("Failed to load RabbitMQ settings")?;
    let topology = match &settings.topology_file {
        Some(path) => config::load_topology(path)?,
        None => config::default_topology(),
    };

    let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<RabbitMQError>();
    let observer = Arc::new(move |err: &RabbitMQError| {
        let _ = failure_tx.send(err.clone());
    });

    let manager = ConnectionManager::with_lapin(settings.connection_config(), observer)?;
    manager.connect().await.context("Failed to connect to RabbitMQ")?;

    let errors = TopologyDeclarator::new(manager.clone())
        .declare_topology(&topology)
        .await;
    for err in &errors {
        warn!(error = %err, "Topology item was not declared");
    }

    let consumer = match topology.queues.first() {
        Some(queue) => {
            let handle = Consumer::new(manager.clone())
                .start_consumer(
                    ConsumerConfig::new(queue.name.clone()).with_prefetch(10),
                    handler_fn(|delivery: Delivery| async move {
                        match delivery.json::<OrderCreated>() {
                            Ok(order) => info!("Received order: {:?}", order),
                            Err(e) => warn!(delivery_tag = delivery.delivery_tag, "Unexpected payload: {}", e),
                        }
                        delivery.ack().await?;
                        Ok::<(), BoxError>(())
                    }),
                )
                .await
                .context("Failed to start consumer")?;
            Some(handle)
        }
        None => None,
    };

    if let Some(target) = publish_target(&topology) {
        let order = OrderCreated {
            order_id: Uuid::new_v4().to_string(),
            customer_id: "customer-123".to_string(),
            items: vec!["product-1".to_string(), "product-2".to_string()],
            total: 59.99,
            timestamp: Utc::now(),
        };
        Producer::new(manager.clone())
            .publish_json(&CancellationToken::new(), &target, &order)
            .await
            .context("Failed to publish demo order")?;
        info!(order_id = %order.order_id, "Published order");
    }

    info!("Service running. Press Ctrl+C to exit.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        Some(err) = failure_rx.recv() => error!(error = %err, "RabbitMQ failure, shutting down"),
    }

    if let Some(consumer) = consumer {
        if let Err(e) = consumer.stop().await {
            warn!(error = %e, "Consumer did not stop cleanly");
        }
    }
    manager.close().await.context("Failed to close RabbitMQ connection")?;
    Ok(())
}

/// The first bind of the first queue, or the queue itself through the default exchange.
fn publish_target(topology: &TopologySpec) -> Option<ProducerConfig> {
    let queue = topology.queues.first()?;
    Some(match queue.binds.first() {
        Some(bind) => ProducerConfig::new(bind.exchange.clone(), bind.routing_key.clone()),
        None => ProducerConfig::new("", queue.name.clone()),
    })
}
