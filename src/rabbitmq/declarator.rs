// src/rabbitmq/declarator.rs
//! Declares exchanges, queues and bindings over the manager's live channel.
//!
//! Single-item calls return their error directly. Batch calls never stop
//! early: every item is attempted in input order and the errors come back
//! in that same order, each naming the item it belongs to.

use tracing::{debug, info, warn};

use super::connection::{ChannelHandle, ConnectionManager};
use super::errors::{RabbitMQError, Result};
use super::topology::{ExchangeSpec, QueueInfo, QueueSpec, TopologyItem, TopologySpec};

#[derive(Debug, Clone)]
pub struct TopologyDeclarator {
    manager: ConnectionManager,
}

#[derive(Clone, Copy)]
enum Declaration<'a> {
    Exchange(&'a ExchangeSpec),
    Queue(&'a QueueSpec),
}

impl Declaration<'_> {
    fn item(&self) -> TopologyItem {
        match self {
            Declaration::Exchange(spec) => TopologyItem::Exchange(spec.name.clone()),
            Declaration::Queue(spec) => TopologyItem::Queue(spec.name.clone()),
        }
    }
}

impl TopologyDeclarator {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let channel = self.manager.get_channel()?;
        let declared = declare_exchange_on(&channel, spec).await;
        if declared.is_err() {
            self.await_reopen(&channel).await;
        }
        declared
    }

    /// Declares the queue, then applies its binds in order. Binds target the
    /// broker-reported name, so server-named queues can be bound too.
    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<QueueInfo> {
        let channel = self.manager.get_channel()?;
        let declared = declare_queue_on(&channel, spec).await;
        if declared.is_err() {
            self.await_reopen(&channel).await;
        }
        declared
    }

    pub async fn declare_exchanges(&self, specs: &[ExchangeSpec]) -> Vec<RabbitMQError> {
        self.declare_batch(specs.iter().map(Declaration::Exchange)).await
    }

    pub async fn declare_queues(&self, specs: &[QueueSpec]) -> Vec<RabbitMQError> {
        self.declare_batch(specs.iter().map(Declaration::Queue)).await
    }

    /// Exchanges first, then queues, so binds can reference exchanges from the same call.
    pub async fn declare_all(
        &self,
        queue_specs: &[QueueSpec],
        exchange_specs: &[ExchangeSpec],
    ) -> Vec<RabbitMQError> {
        let declarations = exchange_specs
            .iter()
            .map(Declaration::Exchange)
            .chain(queue_specs.iter().map(Declaration::Queue));
        self.declare_batch(declarations).await
    }

    pub async fn declare_topology(&self, topology: &TopologySpec) -> Vec<RabbitMQError> {
        self.declare_all(&topology.queues, &topology.exchanges).await
    }

    async fn declare_batch<'a>(
        &self,
        declarations: impl IntoIterator<Item = Declaration<'a>>,
    ) -> Vec<RabbitMQError> {
        let mut errors = Vec::new();

        for (index, declaration) in declarations.into_iter().enumerate() {
            let channel = match self.manager.get_channel() {
                Ok(channel) => channel,
                Err(err) => {
                    errors.push(RabbitMQError::declaration(declaration.item(), err));
                    continue;
                }
            };

            let result = match declaration {
                Declaration::Exchange(spec) => declare_exchange_on(&channel, spec).await,
                Declaration::Queue(spec) => declare_queue_on(&channel, spec).await.map(|_| ()),
            };

            if let Err(err) = result {
                warn!(index, error = %err, "Topology declaration failed, continuing with the rest");
                errors.push(err);
                self.settle(&channel).await;
            }
        }

        if errors.is_empty() {
            debug!("Topology batch declared");
        }
        errors
    }

    /// A rejected declaration costs the channel, never the connection. Returns
    /// once the manager has reopened it.
    async fn await_reopen(&self, channel: &ChannelHandle) {
        if channel.is_open() || !channel.closed().await.channel_exception {
            return;
        }
        self.settle(channel).await;
    }

    /// Waits for the manager to replace a closed channel before the next item
    /// is attempted.
    async fn settle(&self, channel: &ChannelHandle) {
        if channel.is_open() {
            return;
        }
        match self.manager.wait_for_recovery(channel.generation()).await {
            Ok(recovered) => debug!(
                generation = recovered.generation(),
                "Channel recovered after declaration failure"
            ),
            Err(err) => warn!(error = %err, "Channel did not recover after declaration failure"),
        }
    }
}

async fn declare_exchange_on(channel: &ChannelHandle, spec: &ExchangeSpec) -> Result<()> {
    let item = TopologyItem::Exchange(spec.name.clone());
    if spec.name.is_empty() {
        return Err(RabbitMQError::declaration(
            item,
            RabbitMQError::ConfigError("exchange name must not be empty".to_string()),
        ));
    }

    channel
        .exchange_declare(spec)
        .await
        .map_err(|e| RabbitMQError::declaration(item, e))?;

    info!(exchange = %spec.name, kind = %spec.kind, "Declared exchange");
    Ok(())
}

async fn declare_queue_on(channel: &ChannelHandle, spec: &QueueSpec) -> Result<QueueInfo> {
    if let Some(bind) = spec.binds.iter().find(|bind| bind.exchange.is_empty()) {
        return Err(RabbitMQError::declaration(
            TopologyItem::Binding {
                queue: spec.name.clone(),
                exchange: String::new(),
                routing_key: bind.routing_key.clone(),
            },
            RabbitMQError::ConfigError("bind source exchange must not be empty".to_string()),
        ));
    }

    let info = channel
        .queue_declare(spec)
        .await
        .map_err(|e| RabbitMQError::declaration(TopologyItem::Queue(spec.name.clone()), e))?;

    for bind in &spec.binds {
        channel.queue_bind(&info.name, bind).await.map_err(|e| {
            RabbitMQError::declaration(
                TopologyItem::Binding {
                    queue: info.name.clone(),
                    exchange: bind.exchange.clone(),
                    routing_key: bind.routing_key.clone(),
                },
                e,
            )
        })?;
        debug!(queue = %info.name, exchange = %bind.exchange, routing_key = %bind.routing_key, "Bound queue");
    }

    info!(
        queue = %info.name,
        messages = info.message_count,
        consumers = info.consumer_count,
        "Declared queue"
    );
    Ok(info)
}
