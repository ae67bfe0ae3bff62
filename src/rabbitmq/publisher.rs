// src/rabbitmq/publisher.rs

use serde::Serialize;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::message::{Message, ProducerConfig};

/// Publishes through the manager's live channel.
///
/// The channel is shared by everything using the same manager. Publishing
/// from several tasks at once is not serialized here; callers that do so
/// must put their own mutual exclusion around [`Producer::publish`].
#[derive(Debug, Clone)]
pub struct Producer {
    manager: ConnectionManager,
}

impl Producer {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Sends `message` once. When `cancel` fires or `config.timeout` elapses
    /// before the broker answers, the result is `Cancelled` and whether the
    /// message went out is unknown.
    pub async fn publish(
        &self,
        cancel: &CancellationToken,
        config: &ProducerConfig,
        message: &Message,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(RabbitMQError::Cancelled(
                "publish cancelled before reaching the broker".to_string(),
            ));
        }

        let channel = self.manager.get_channel()?;
        let publish = timeout(config.timeout, channel.basic_publish(config, message));

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(exchange = %config.exchange, routing_key = %config.routing_key, "Publish cancelled, outcome unknown");
                Err(RabbitMQError::Cancelled(
                    "publish cancelled, delivery outcome unknown".to_string(),
                ))
            }
            outcome = publish => match outcome {
                Ok(result) => {
                    result?;
                    debug!(
                        "Published message to exchange '{}' with routing key '{}'",
                        config.exchange, config.routing_key
                    );
                    Ok(())
                }
                Err(_) => Err(RabbitMQError::Cancelled(format!(
                    "publish timed out after {}ms, delivery outcome unknown",
                    config.timeout.as_millis()
                ))),
            },
        }
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        cancel: &CancellationToken,
        config: &ProducerConfig,
        value: &T,
    ) -> Result<()> {
        let message = Message::json(value)?;
        self.publish(cancel, config, &message).await
    }
}
