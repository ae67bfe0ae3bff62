// src/rabbitmq/consumer.rs

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::connection::{ChannelHandle, ConnectionManager};
use super::errors::{RabbitMQError, Result};
use super::message::{ConsumerConfig, Delivery};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Processes one delivery at a time. With manual acknowledgement the handler
/// settles the delivery itself; an error it returns is logged and nothing more.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery) -> std::result::Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> DeliveryHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> std::result::Result<(), BoxError> {
        (self)(delivery).await
    }
}

/// Wraps an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn DeliveryHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    Arc::new(f)
}

/// One registered consumer and the task feeding its handler.
/// Dropping it detaches the task; use [`Subscription::stop`] to cancel at the broker.
pub struct Subscription {
    consumer_tag: String,
    channel: ChannelHandle,
    stop: CancellationToken,
    task: JoinHandle<()>,
    joined: bool,
}

impl Subscription {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Generation of the channel this consumer is registered on.
    pub fn generation(&self) -> u64 {
        self.channel.generation()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the consumer (best effort when the channel is already gone) and
    /// waits for the handler call in progress, if any.
    pub async fn stop(mut self) -> Result<()> {
        self.stop.cancel();
        let cancelled = if self.channel.is_open() {
            self.channel.basic_cancel(&self.consumer_tag).await
        } else {
            Ok(())
        };
        self.join().await?;
        debug!(consumer_tag = %self.consumer_tag, "Consumer stopped");
        cancelled
    }

    /// Resolves once the delivery stream has ended.
    pub async fn wait(mut self) -> Result<()> {
        self.join().await
    }

    async fn join(&mut self) -> Result<()> {
        if self.joined {
            return Ok(());
        }
        let joined = (&mut self.task).await;
        self.joined = true;
        joined.map_err(|e| {
            RabbitMQError::ConsumeError(format!(
                "delivery task of consumer {} failed: {e}",
                self.consumer_tag
            ))
        })
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer_tag", &self.consumer_tag)
            .field("generation", &self.generation())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Handle to a supervised consumer started with [`Consumer::start_consumer`].
#[derive(Debug)]
pub struct ConsumerHandle {
    stop: CancellationToken,
    resubscribes: Arc<AtomicU32>,
    task: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    /// Times the consumer re-registered after a reconnect.
    pub fn resubscribe_count(&self) -> u32 {
        self.resubscribes.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn stop(self) -> Result<()> {
        self.stop.cancel();
        self.wait().await
    }

    /// Resolves when the consumer terminates: `Ok` after `stop`, the terminal error otherwise.
    pub async fn wait(self) -> Result<()> {
        self.task.await.map_err(|e| {
            RabbitMQError::ConsumeError(format!("supervised consumer task failed: {e}"))
        })?
    }
}

#[derive(Debug, Clone)]
pub struct Consumer {
    manager: ConnectionManager,
}

impl Consumer {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Subscribes to `config.queue` on the live channel. Deliveries reach
    /// `handler` strictly one after another on a dedicated task.
    pub async fn consume(
        &self,
        config: &ConsumerConfig,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        let channel = self.manager.get_channel()?;
        subscribe(&channel, config, handler).await
    }

    /// Like [`Consumer::consume`], but re-subscribes with the same config and
    /// handler after every successful reconnect. Ends when stopped, when the
    /// manager gives up, or when the broker refuses or cancels the consumer on
    /// a healthy channel; the last case is reported to the failure observer.
    pub async fn start_consumer(
        &self,
        config: ConsumerConfig,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<ConsumerHandle> {
        let subscription = self.consume(&config, handler.clone()).await?;

        let stop = CancellationToken::new();
        let resubscribes = Arc::new(AtomicU32::new(0));
        let task = tokio::spawn(supervise(
            self.manager.clone(),
            config,
            handler,
            subscription,
            stop.clone(),
            resubscribes.clone(),
        ));

        Ok(ConsumerHandle {
            stop,
            resubscribes,
            task,
        })
    }
}

async fn supervise(
    manager: ConnectionManager,
    config: ConsumerConfig,
    handler: Arc<dyn DeliveryHandler>,
    mut subscription: Subscription,
    stop: CancellationToken,
    resubscribes: Arc<AtomicU32>,
) -> Result<()> {
    loop {
        let ended = tokio::select! {
            _ = stop.cancelled() => None,
            joined = subscription.join() => Some(joined),
        };
        match ended {
            None => {
                info!(queue = %config.queue, "Stopping supervised consumer");
                return subscription.stop().await;
            }
            Some(Err(err)) => {
                manager.report_failure(&err);
                return Err(err);
            }
            Some(Ok(())) => {}
        }

        let generation = subscription.generation();
        let same_channel = subscription.channel.is_open()
            && manager
                .get_channel()
                .is_ok_and(|current| current.generation() == generation);
        if same_channel {
            let err = RabbitMQError::ConsumeError(format!(
                "consumer {} on queue '{}' was cancelled by the broker",
                subscription.consumer_tag, config.queue
            ));
            error!(error = %err, "Supervised consumer stopped");
            manager.report_failure(&err);
            return Err(err);
        }

        warn!(queue = %config.queue, generation, "Consumer channel lost, waiting for reconnect");
        let mut stale = generation;
        subscription = loop {
            let channel = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                recovered = manager.wait_for_recovery(stale) => recovered,
            };
            let channel = match channel {
                Ok(channel) => channel,
                Err(err) => {
                    // the manager already reported its terminal failure
                    warn!(queue = %config.queue, error = %err, "Supervised consumer giving up");
                    return Err(err);
                }
            };

            match subscribe(&channel, &config, handler.clone()).await {
                Ok(next) => break next,
                Err(err) if !channel.is_open() => {
                    warn!(queue = %config.queue, error = %err, "Resubscribe hit a closed channel");
                    stale = channel.generation();
                }
                Err(err) => {
                    error!(queue = %config.queue, error = %err, "Resubscribe refused");
                    manager.report_failure(&err);
                    return Err(err);
                }
            }
        };

        let count = resubscribes.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            queue = %config.queue,
            consumer_tag = %subscription.consumer_tag,
            generation = subscription.generation(),
            resubscribes = count,
            "Resubscribed consumer"
        );
    }
}

async fn subscribe(
    channel: &ChannelHandle,
    config: &ConsumerConfig,
    handler: Arc<dyn DeliveryHandler>,
) -> Result<Subscription> {
    if config.prefetch_count > 0 {
        channel.basic_qos(config.prefetch_count).await?;
    }

    let consumer_tag = if config.consumer_tag.is_empty() {
        format!("consumer-{}", Uuid::new_v4())
    } else {
        config.consumer_tag.clone()
    };
    let mut deliveries = channel.basic_consume(config, &consumer_tag).await?;
    info!(
        queue = %config.queue,
        consumer_tag = %consumer_tag,
        generation = channel.generation(),
        "Started consuming from queue"
    );

    let stop = CancellationToken::new();
    let task = {
        let stop = stop.clone();
        let consumer_tag = consumer_tag.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    next = deliveries.next() => next,
                };
                match next {
                    Some(Ok(delivery)) => {
                        let delivery_tag = delivery.delivery_tag;
                        if let Err(e) = handler.handle(delivery).await {
                            error!(consumer_tag = %consumer_tag, delivery_tag, "Error processing message: {}", e);
                        }
                    }
                    Some(Err(e)) => {
                        error!(consumer_tag = %consumer_tag, "Error receiving message: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            debug!(consumer_tag = %consumer_tag, "Delivery stream ended");
        })
    };

    Ok(Subscription {
        consumer_tag,
        channel: channel.clone(),
        stop,
        task,
        joined: false,
    })
}
