// src/rabbitmq/memory.rs
//! In-process broker implementing the same seam as the lapin client.
//!
//! Follows AMQP 0-9-1 semantics closely enough to exercise the connection
//! manager without a running RabbitMQ:
//! - soft errors (`NOT_FOUND`, `PRECONDITION_FAILED`, ...) close the channel, hard ones the connection
//! - declarations are idempotent for identical parameters
//! - direct, fanout, topic and headers routing plus the default exchange
//! - round-robin dispatch, prefetch and requeue of unacked deliveries on channel close

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::errors::{RabbitMQError, Result};
use super::message::{ConsumerConfig, Delivery, Message, ProducerConfig};
use super::topology::{ArgValue, Arguments, BindSpec, ExchangeKind, ExchangeSpec, QueueInfo, QueueSpec};
use super::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, CloseReason, CloseSignal, Connector,
    DeliveryStream,
};

const DEFAULT_EXCHANGES: [(&str, ExchangeKind); 5] = [
    ("", ExchangeKind::Direct),
    ("amq.direct", ExchangeKind::Direct),
    ("amq.fanout", ExchangeKind::Fanout),
    ("amq.topic", ExchangeKind::Topic),
    ("amq.headers", ExchangeKind::Headers),
];

// AMQP reply codes that close only the offending channel
const SOFT_ERRORS: [&str; 7] = [
    "CONTENT_TOO_LARGE",
    "NO_ROUTE",
    "NO_CONSUMERS",
    "ACCESS_REFUSED",
    "NOT_FOUND",
    "RESOURCE_LOCKED",
    "PRECONDITION_FAILED",
];

type Shared = Arc<Mutex<BrokerState>>;

/// A broker living in this process. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Shared,
}

struct BrokerState {
    this: Weak<Mutex<BrokerState>>,
    available: bool,
    connect_attempts: u32,
    next_id: u64,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
}

struct ConnectionEntry {
    signal: CloseSignal,
    channels: Vec<u64>,
}

struct ChannelEntry {
    connection: u64,
    signal: CloseSignal,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    content_type: String,
    headers: Arguments,
    correlation_id: Option<String>,
    redelivered: bool,
}

struct QueueState {
    spec: QueueSpec,
    owner: Option<u64>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
    had_consumers: bool,
}

struct ConsumerSlot {
    tag: String,
    channel: u64,
    no_ack: bool,
    exclusive: bool,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

#[derive(Debug, Clone, PartialEq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
    arguments: Arguments,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let state = Arc::new_cyclic(|this| {
            let exchanges = DEFAULT_EXCHANGES
                .iter()
                .map(|(name, kind)| {
                    let spec = ExchangeSpec::new(*name, *kind).durable(true);
                    (name.to_string(), spec)
                })
                .collect();

            Mutex::new(BrokerState {
                this: this.clone(),
                available: true,
                connect_attempts: 0,
                next_id: 0,
                exchanges,
                queues: HashMap::new(),
                bindings: Vec::new(),
                connections: HashMap::new(),
                channels: HashMap::new(),
            })
        });

        Self { state }
    }

    /// While unavailable every connection attempt is refused.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Connection attempts seen so far, refused ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Closes every open channel from the broker side. Returns how many were closed.
    pub fn force_close_channels(&self) -> usize {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in &ids {
            close_channel(&mut state, *id, &CloseReason::new("CHANNEL_ERROR - channel closed by broker"));
        }
        ids.len()
    }

    /// Closes every open connection from the broker side. Returns how many were closed.
    pub fn force_close_connections(&self) -> usize {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in &ids {
            close_connection(&mut state, *id, "CONNECTION_FORCED - broker forced connection closure");
        }
        ids.len()
    }

    /// Deletes `queue` the way an administrator would. Its consumers are
    /// cancelled while their channels stay open.
    pub fn delete_queue(&self, queue: &str) -> bool {
        let mut state = self.lock();
        let existed = state.queues.contains_key(queue);
        delete_queue(&mut state, queue);
        existed
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Number of user-declared queues.
    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    /// Ready (undelivered) messages in `queue`.
    pub fn message_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.messages.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.consumers.len())
    }

    /// `(exchange, routing_key)` pairs bound to `queue`.
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.lock()
            .bindings
            .iter()
            .filter(|binding| binding.queue == queue)
            .map(|binding| (binding.exchange.clone(), binding.routing_key.clone()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBroker")
            .field("available", &state.available)
            .field("connections", &state.connections.len())
            .field("channels", &state.channels.len())
            .field("queues", &state.queues.len())
            .finish()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.lock();
        state.connect_attempts += 1;

        if !(uri.starts_with("amqp://") || uri.starts_with("amqps://")) {
            return Err(RabbitMQError::ConnectionError(format!(
                "invalid AMQP URI scheme in '{uri}'"
            )));
        }
        if !state.available {
            return Err(RabbitMQError::ConnectionError(
                "connection refused: broker unavailable".to_string(),
            ));
        }

        let id = state.next_id();
        let signal = CloseSignal::new();
        state.connections.insert(
            id,
            ConnectionEntry {
                signal: signal.clone(),
                channels: Vec::new(),
            },
        );
        debug!(connection_id = id, "Opened in-memory connection");

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
            signal,
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    signal: CloseSignal,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(RabbitMQError::ChannelError(
                "Failed to create channel: connection is closed".to_string(),
            ));
        }

        let id = state.next_id();
        let signal = CloseSignal::new();
        state.channels.insert(
            id,
            ChannelEntry {
                connection: self.id,
                signal: signal.clone(),
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
            },
        );
        if let Some(connection) = state.connections.get_mut(&self.id) {
            connection.channels.push(id);
        }

        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            broker: self.broker.clone(),
            signal,
        }))
    }

    fn is_open(&self) -> bool {
        !self.signal.is_closed()
    }

    async fn closed(&self) -> CloseReason {
        self.signal.closed().await
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        close_connection(&mut state, self.id, "connection closed by application");
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    connection: u64,
    broker: MemoryBroker,
    signal: CloseSignal,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.broker.lock();
        if !state.channels.contains_key(&self.id) {
            return Err(RabbitMQError::ChannelError("channel is closed".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        !self.signal.is_closed()
    }

    async fn closed(&self) -> CloseReason {
        self.signal.closed().await
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        close_channel(&mut state, self.id, &CloseReason::new("channel closed by application"));
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        let _state = self.open_state()?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        let mut state = self.open_state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<()> {
        let mut state = self.open_state()?;

        if spec.name.is_empty() || spec.name.starts_with("amq.") {
            let reason = amqp_exception(
                &mut state,
                self.id,
                "ACCESS_REFUSED",
                format!("exchange name '{}' is reserved", spec.name),
            );
            return Err(RabbitMQError::ChannelError(reason));
        }

        match state.exchanges.get(&spec.name) {
            Some(existing) if !existing.same_declaration(spec) => {
                let reason = amqp_exception(
                    &mut state,
                    self.id,
                    "PRECONDITION_FAILED",
                    format!("inequivalent arg for exchange '{}'", spec.name),
                );
                Err(RabbitMQError::ChannelError(reason))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueInfo> {
        let mut state = self.open_state()?;

        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else if spec.name.starts_with("amq.") {
            let reason = amqp_exception(
                &mut state,
                self.id,
                "ACCESS_REFUSED",
                format!("queue name '{}' contains reserved prefix 'amq.'", spec.name),
            );
            return Err(RabbitMQError::ChannelError(reason));
        } else {
            spec.name.clone()
        };

        let conflict = state.queues.get(&name).and_then(|existing| {
            if existing.owner.is_some_and(|owner| owner != self.connection) {
                Some(("RESOURCE_LOCKED", format!("cannot obtain exclusive access to queue '{name}'")))
            } else if !existing.spec.same_declaration(spec) {
                Some(("PRECONDITION_FAILED", format!("inequivalent arg for queue '{name}'")))
            } else {
                None
            }
        });
        if let Some((code, text)) = conflict {
            let reason = amqp_exception(&mut state, self.id, code, text);
            return Err(RabbitMQError::ChannelError(reason));
        }

        let connection = self.connection;
        let queue = state.queues.entry(name.clone()).or_insert_with(|| QueueState {
            spec: QueueSpec {
                name: name.clone(),
                binds: Vec::new(),
                ..spec.clone()
            },
            owner: spec.exclusive.then_some(connection),
            messages: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            had_consumers: false,
        });

        Ok(QueueInfo {
            name,
            message_count: queue.messages.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    async fn queue_bind(&self, queue: &str, bind: &BindSpec) -> Result<()> {
        let mut state = self.open_state()?;

        let failure = if bind.exchange.is_empty() {
            Some(("ACCESS_REFUSED", "operation not permitted on the default exchange".to_string()))
        } else if !state.queues.contains_key(queue) {
            Some(("NOT_FOUND", format!("no queue '{queue}' in vhost '/'")))
        } else if !state.exchanges.contains_key(&bind.exchange) {
            Some(("NOT_FOUND", format!("no exchange '{}' in vhost '/'", bind.exchange)))
        } else {
            None
        };
        if let Some((code, text)) = failure {
            let reason = amqp_exception(&mut state, self.id, code, text);
            return Err(RabbitMQError::ChannelError(reason));
        }

        let binding = Binding {
            exchange: bind.exchange.clone(),
            queue: queue.to_string(),
            routing_key: bind.routing_key.clone(),
            arguments: bind.arguments.clone(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_publish(&self, config: &ProducerConfig, message: &Message) -> Result<()> {
        let mut state = self.open_state()?;

        if config.immediate {
            let reason = amqp_exception(
                &mut state,
                self.id,
                "NOT_IMPLEMENTED",
                "immediate=true".to_string(),
            );
            return Err(RabbitMQError::PublishError(reason));
        }

        let Some(exchange) = state.exchanges.get(&config.exchange).cloned() else {
            let reason = amqp_exception(
                &mut state,
                self.id,
                "NOT_FOUND",
                format!("no exchange '{}' in vhost '/'", config.exchange),
            );
            return Err(RabbitMQError::PublishError(reason));
        };

        let targets = route(&state, &exchange, &config.routing_key, message.headers());
        if targets.is_empty() {
            if config.mandatory {
                return Err(RabbitMQError::PublishError(format!(
                    "NO_ROUTE - message to exchange '{}' with routing key '{}' was returned",
                    config.exchange, config.routing_key
                )));
            }
            debug!(exchange = %config.exchange, routing_key = %config.routing_key, "Dropping unroutable message");
            return Ok(());
        }

        let stored = StoredMessage {
            exchange: config.exchange.clone(),
            routing_key: config.routing_key.clone(),
            body: message.body().to_vec(),
            content_type: message.content_type().to_string(),
            headers: message.headers().clone(),
            correlation_id: message.correlation_id().map(str::to_string),
            redelivered: false,
        };
        for queue in &targets {
            if let Some(target) = state.queues.get_mut(queue) {
                target.messages.push_back(stored.clone());
            }
            dispatch(&mut state, queue);
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        config: &ConsumerConfig,
        consumer_tag: &str,
    ) -> Result<DeliveryStream> {
        let mut state = self.open_state()?;

        let failure = match state.queues.get(&config.queue) {
            None => Some(("NOT_FOUND", format!("no queue '{}' in vhost '/'", config.queue))),
            Some(queue) if queue.owner.is_some_and(|owner| owner != self.connection) => Some((
                "RESOURCE_LOCKED",
                format!("cannot obtain exclusive access to queue '{}'", config.queue),
            )),
            Some(queue)
                if queue.consumers.iter().any(|c| c.exclusive)
                    || (config.exclusive && !queue.consumers.is_empty()) =>
            {
                Some((
                    "ACCESS_REFUSED",
                    format!("queue '{}' in vhost '/' in exclusive use", config.queue),
                ))
            }
            Some(queue)
                if queue
                    .consumers
                    .iter()
                    .any(|c| c.channel == self.id && c.tag == consumer_tag) =>
            {
                Some(("NOT_ALLOWED", format!("attempt to reuse consumer tag '{consumer_tag}'")))
            }
            Some(_) => None,
        };
        if let Some((code, text)) = failure {
            let reason = amqp_exception(&mut state, self.id, code, text);
            return Err(RabbitMQError::ConsumeError(reason));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(queue) = state.queues.get_mut(&config.queue) {
            queue.consumers.push(ConsumerSlot {
                tag: consumer_tag.to_string(),
                channel: self.id,
                no_ack: config.auto_ack,
                exclusive: config.exclusive,
                sender,
            });
            queue.had_consumers = true;
        }
        dispatch(&mut state, &config.queue);

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.open_state()?;
        let channel = self.id;
        remove_consumers(&mut state, |slot| {
            slot.channel == channel && slot.tag == consumer_tag
        });
        Ok(())
    }
}

struct MemoryAcker {
    broker: Weak<Mutex<BrokerState>>,
    channel: u64,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| RabbitMQError::AckError("broker is gone".to_string()))?;
        let mut state = lock(&broker);

        let Some(channel) = state.channels.get_mut(&self.channel) else {
            return Err(RabbitMQError::AckError(format!(
                "cannot settle delivery {}: channel is closed",
                self.delivery_tag
            )));
        };
        let Some(unacked) = channel.unacked.remove(&self.delivery_tag) else {
            let reason = amqp_exception(
                &mut state,
                self.channel,
                "PRECONDITION_FAILED",
                format!("unknown delivery tag {}", self.delivery_tag),
            );
            return Err(RabbitMQError::AckError(reason));
        };

        if requeue == Some(true) {
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }

        // a freed prefetch slot may unblock any queue this channel consumes from
        let queues: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, queue)| queue.consumers.iter().any(|c| c.channel == self.channel))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in queues {
            dispatch(&mut state, &queue);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Closes `channel` the way a broker answers a channel-level exception.
fn amqp_exception(state: &mut BrokerState, channel: u64, code: &str, text: String) -> String {
    let reason = format!("{code} - {text}");
    if SOFT_ERRORS.contains(&code) {
        warn!(channel_id = channel, %reason, "Closing channel after channel exception");
        close_channel(state, channel, &CloseReason::channel_exception(reason.clone()));
    } else if let Some(connection) = state.channels.get(&channel).map(|entry| entry.connection) {
        warn!(channel_id = channel, %reason, "Closing connection after connection exception");
        close_connection(state, connection, &reason);
    }
    reason
}

fn close_channel(state: &mut BrokerState, id: u64, reason: &CloseReason) {
    let Some(entry) = state.channels.remove(&id) else {
        return;
    };
    entry.signal.close(reason.clone());
    if let Some(connection) = state.connections.get_mut(&entry.connection) {
        connection.channels.retain(|channel| *channel != id);
    }

    let mut touched = Vec::new();
    for (_, unacked) in entry.unacked.into_iter().rev() {
        if let Some(queue) = state.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.messages.push_front(message);
            touched.push(unacked.queue);
        }
    }

    remove_consumers(state, |slot| slot.channel == id);
    for queue in touched {
        dispatch(state, &queue);
    }
}

fn close_connection(state: &mut BrokerState, id: u64, reason: &str) {
    let Some(entry) = state.connections.remove(&id) else {
        return;
    };
    let reason = CloseReason::new(reason);
    for channel in entry.channels {
        close_channel(state, channel, &reason);
    }
    entry.signal.close(reason);

    let exclusive: Vec<String> = state
        .queues
        .iter()
        .filter(|(_, queue)| queue.owner == Some(id))
        .map(|(name, _)| name.clone())
        .collect();
    for queue in exclusive {
        delete_queue(state, &queue);
    }
}

fn remove_consumers(state: &mut BrokerState, mut doomed: impl FnMut(&ConsumerSlot) -> bool) {
    let mut emptied = Vec::new();
    for (name, queue) in state.queues.iter_mut() {
        let before = queue.consumers.len();
        queue.consumers.retain(|slot| !doomed(slot));
        if before != queue.consumers.len() && queue.consumers.is_empty() {
            emptied.push(name.clone());
        }
    }

    for name in emptied {
        let auto_delete = state
            .queues
            .get(&name)
            .is_some_and(|queue| queue.spec.auto_delete && queue.had_consumers);
        if auto_delete {
            delete_queue(state, &name);
        }
    }
}

fn delete_queue(state: &mut BrokerState, name: &str) {
    state.queues.remove(name);
    state.bindings.retain(|binding| binding.queue != name);
    debug!(queue = name, "Deleted queue");
}

fn dispatch(state: &mut BrokerState, queue_name: &str) {
    let BrokerState {
        this,
        queues,
        channels,
        ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    while !queue.messages.is_empty() && !queue.consumers.is_empty() {
        let count = queue.consumers.len();
        let picked = (0..count).map(|offset| (queue.cursor + offset) % count).find(|idx| {
            let slot = &queue.consumers[*idx];
            slot.no_ack
                || channels.get(&slot.channel).is_some_and(|channel| {
                    channel.prefetch == 0 || channel.unacked.len() < usize::from(channel.prefetch)
                })
        });
        let Some(idx) = picked else {
            break;
        };
        let (channel_id, no_ack, sender) = {
            let slot = &queue.consumers[idx];
            (slot.channel, slot.no_ack, slot.sender.clone())
        };
        let Some(channel) = channels.get_mut(&channel_id) else {
            queue.consumers.remove(idx);
            continue;
        };
        let Some(message) = queue.messages.pop_front() else {
            break;
        };

        channel.next_tag += 1;
        let delivery_tag = channel.next_tag;
        let acker: Option<Arc<dyn Acknowledger>> = if no_ack {
            None
        } else {
            Some(Arc::new(MemoryAcker {
                broker: this.clone(),
                channel: channel_id,
                delivery_tag,
            }))
        };

        if sender.send(Ok(message.to_delivery(delivery_tag, acker))).is_err() {
            // subscriber dropped its stream without cancelling
            queue.messages.push_front(message);
            queue.consumers.remove(idx);
            continue;
        }
        if !no_ack {
            channel.unacked.insert(
                delivery_tag,
                Unacked {
                    queue: queue_name.to_string(),
                    message,
                },
            );
        }
        queue.cursor = idx + 1;
    }
}

impl StoredMessage {
    fn to_delivery(&self, delivery_tag: u64, acker: Option<Arc<dyn Acknowledger>>) -> Delivery {
        let mut delivery = Delivery::new(
            delivery_tag,
            self.exchange.as_str(),
            self.routing_key.as_str(),
            self.body.clone(),
            acker,
        );
        delivery.redelivered = self.redelivered;
        delivery.content_type = (!self.content_type.is_empty()).then(|| self.content_type.clone());
        delivery.headers = self.headers.clone();
        delivery.correlation_id = self.correlation_id.clone();
        delivery
    }
}

fn route(state: &BrokerState, exchange: &ExchangeSpec, routing_key: &str, headers: &Arguments) -> Vec<String> {
    if exchange.name.is_empty() {
        return if state.queues.contains_key(routing_key) {
            vec![routing_key.to_string()]
        } else {
            Vec::new()
        };
    }

    let mut targets: Vec<String> = Vec::new();
    for binding in state.bindings.iter().filter(|b| b.exchange == exchange.name) {
        let matched = match exchange.kind {
            ExchangeKind::Direct => binding.routing_key == routing_key,
            ExchangeKind::Fanout => true,
            ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            ExchangeKind::Headers => headers_match(&binding.arguments, headers),
        };
        if matched && !targets.contains(&binding.queue) {
            targets.push(binding.queue.clone());
        }
    }
    targets
}

/// `*` matches exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &words)
}

fn words_match(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| words_match(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && words_match(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && words_match(rest, &words[1..]),
    }
}

fn headers_match(binding: &Arguments, headers: &Arguments) -> bool {
    let any = binding.get("x-match").and_then(ArgValue::as_str) == Some("any");
    let mut required = binding.iter().filter(|(key, _)| !key.starts_with("x-"));

    if any {
        required.any(|(key, value)| headers.get(key) == Some(value))
    } else {
        required.all(|(key, value)| headers.get(key) == Some(value))
    }
}
