// src/rabbitmq/amqp_client.rs
// lapin-backed implementation of the broker seam

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::AMQPErrorKind;
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};
use uuid::Uuid;

use super::connection::redact_uri;
use super::errors::{RabbitMQError, Result};
use super::message::{ConsumerConfig, Delivery, Message, ProducerConfig};
use super::topology::{ArgValue, Arguments, BindSpec, ExchangeKind, ExchangeSpec, QueueInfo, QueueSpec};
use super::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, CloseReason, CloseSignal, Connector,
    DeliveryStream,
};

const REPLY_SUCCESS: u16 = 200;

// lapin does not report every local close through on_error
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Dials RabbitMQ with lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector {
    connection_name: Option<String>,
}

impl LapinConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name shown for the connection in the RabbitMQ management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    fn properties(&self) -> ConnectionProperties {
        match &self.connection_name {
            Some(name) => ConnectionProperties::default()
                .with_connection_name(LongString::from(name.as_str())),
            None => ConnectionProperties::default(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        info!("Connecting to RabbitMQ at {}", redact_uri(uri));
        let connection = Connection::connect(uri, self.properties())
            .await
            .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect: {e}")))?;

        debug!("Successfully connected to RabbitMQ");
        Ok(Arc::new(LapinConnection::new(connection)))
    }
}

struct LapinConnection {
    connection: Connection,
    signal: CloseSignal,
}

impl LapinConnection {
    fn new(connection: Connection) -> Self {
        let signal = CloseSignal::new();
        let on_error = signal.clone();
        connection.on_error(move |err| {
            on_error.close(format!("connection error: {err}"));
        });

        Self { connection, signal }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {e}")))?;

        debug!(channel_id = channel.id(), "Created channel");
        Ok(Arc::new(LapinChannel::new(channel)))
    }

    fn is_open(&self) -> bool {
        !self.signal.is_closed() && self.connection.status().connected()
    }

    async fn closed(&self) -> CloseReason {
        watch_status(&self.signal, || self.connection.status().connected(), "connection").await
    }

    async fn close(&self) -> Result<()> {
        self.signal.close("connection closed by application");
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "closed by application")
                .await
                .map_err(|e| {
                    RabbitMQError::ConnectionError(format!("Failed to close connection: {e}"))
                })?;
        }
        Ok(())
    }
}

struct LapinChannel {
    channel: Channel,
    signal: CloseSignal,
}

impl LapinChannel {
    fn new(channel: Channel) -> Self {
        let signal = CloseSignal::new();
        let on_error = signal.clone();
        channel.on_error(move |err| {
            on_error.close(channel_close_reason(&err));
        });

        Self { channel, signal }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        !self.signal.is_closed() && self.channel.status().connected()
    }

    async fn closed(&self) -> CloseReason {
        watch_status(&self.signal, || self.channel.status().connected(), "channel").await
    }

    async fn close(&self) -> Result<()> {
        self.signal.close("channel closed by application");
        if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "closed by application")
                .await
                .map_err(|e| RabbitMQError::ChannelError(format!("Failed to close channel: {e}")))?;
        }
        Ok(())
    }

    async fn confirm_select(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<()> {
        self.channel
            .exchange_declare(
                &spec.name,
                exchange_kind(spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    internal: spec.internal,
                    nowait: spec.no_wait,
                    ..ExchangeDeclareOptions::default()
                },
                field_table(&spec.arguments),
            )
            .await?;
        Ok(())
    }

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueInfo> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    nowait: spec.no_wait,
                    ..QueueDeclareOptions::default()
                },
                field_table(&spec.arguments),
            )
            .await?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_bind(&self, queue: &str, bind: &BindSpec) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                &bind.exchange,
                &bind.routing_key,
                QueueBindOptions {
                    nowait: bind.no_wait,
                },
                field_table(&bind.arguments),
            )
            .await?;
        Ok(())
    }

    async fn basic_publish(&self, config: &ProducerConfig, message: &Message) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                &config.exchange,
                &config.routing_key,
                BasicPublishOptions {
                    mandatory: config.mandatory,
                    immediate: config.immediate,
                },
                message.body(),
                properties(message),
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        match confirm
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?
        {
            Confirmation::Nack(_) => Err(RabbitMQError::PublishError(
                "broker negatively acknowledged the message".to_string(),
            )),
            Confirmation::Ack(Some(_)) => Err(RabbitMQError::PublishError(
                "broker returned the message as unroutable".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        config: &ConsumerConfig,
        consumer_tag: &str,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                &config.queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: config.no_local,
                    no_ack: config.auto_ack,
                    exclusive: config.exclusive,
                    nowait: false,
                },
                field_table(&config.arguments),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        let channel = self.channel.clone();
        let auto_ack = config.auto_ack;
        let stream = consumer.map(move |item| match item {
            Ok(delivery) => Ok(into_delivery(delivery, &channel, auto_ack)),
            Err(e) => Err(RabbitMQError::ConsumeError(e.to_string())),
        });

        Ok(stream.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }
}

struct LapinAcker {
    channel: Channel,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.channel
            .basic_ack(self.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                self.delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(self.delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }
}

// Soft errors close only the channel; anything else means the transport is in trouble
fn channel_close_reason(err: &lapin::Error) -> CloseReason {
    let text = format!("channel error: {err}");
    match err {
        lapin::Error::ProtocolError(amqp) if matches!(amqp.kind(), AMQPErrorKind::Soft(_)) => {
            CloseReason::channel_exception(text)
        }
        _ => CloseReason::new(text),
    }
}

async fn watch_status(
    signal: &CloseSignal,
    connected: impl Fn() -> bool,
    what: &str,
) -> CloseReason {
    let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
    loop {
        tokio::select! {
            reason = signal.closed() => return reason,
            _ = ticker.tick() => {
                if !connected() {
                    signal.close(format!("{what} is no longer connected"));
                }
            }
        }
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn properties(message: &Message) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_timestamp(chrono::Utc::now().timestamp() as u64);

    if !message.content_type().is_empty() {
        properties = properties.with_content_type(ShortString::from(message.content_type()));
    }
    if !message.headers().is_empty() {
        properties = properties.with_headers(field_table(message.headers()));
    }
    if let Some(correlation_id) = message.correlation_id() {
        properties = properties.with_correlation_id(ShortString::from(correlation_id));
    }
    properties
}

fn into_delivery(delivery: lapin::message::Delivery, channel: &Channel, auto_ack: bool) -> Delivery {
    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|value| value.as_str().to_string());
    let correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|value| value.as_str().to_string());
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(arguments)
        .unwrap_or_default();

    let acker: Option<Arc<dyn Acknowledger>> = if auto_ack {
        None
    } else {
        Some(Arc::new(LapinAcker {
            channel: channel.clone(),
            delivery_tag: delivery.delivery_tag,
        }))
    };

    let mut out = Delivery::new(
        delivery.delivery_tag,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.data,
        acker,
    );
    out.redelivered = delivery.redelivered;
    out.content_type = content_type;
    out.correlation_id = correlation_id;
    out.headers = headers;
    out
}

pub(crate) fn field_table(arguments: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(ShortString::from(key.as_str()), amqp_value(value));
    }
    table
}

fn amqp_value(value: &ArgValue) -> AMQPValue {
    match value {
        ArgValue::Bool(value) => AMQPValue::Boolean(*value),
        ArgValue::Int(value) => match i32::try_from(*value) {
            Ok(small) => AMQPValue::LongInt(small),
            Err(_) => AMQPValue::LongLongInt(*value),
        },
        ArgValue::Float(value) => AMQPValue::Double(*value),
        ArgValue::Str(value) => AMQPValue::LongString(LongString::from(value.as_str())),
    }
}

fn arguments(table: &FieldTable) -> Arguments {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), arg_value(value)))
        .collect()
}

fn arg_value(value: &AMQPValue) -> ArgValue {
    match value {
        AMQPValue::Boolean(value) => ArgValue::Bool(*value),
        AMQPValue::ShortShortInt(value) => ArgValue::Int((*value).into()),
        AMQPValue::ShortShortUInt(value) => ArgValue::Int((*value).into()),
        AMQPValue::ShortInt(value) => ArgValue::Int((*value).into()),
        AMQPValue::ShortUInt(value) => ArgValue::Int((*value).into()),
        AMQPValue::LongInt(value) => ArgValue::Int((*value).into()),
        AMQPValue::LongUInt(value) => ArgValue::Int((*value).into()),
        AMQPValue::LongLongInt(value) => ArgValue::Int(*value),
        AMQPValue::Float(value) => ArgValue::Float((*value).into()),
        AMQPValue::Double(value) => ArgValue::Float(*value),
        AMQPValue::ShortString(value) => ArgValue::Str(value.as_str().to_string()),
        AMQPValue::LongString(value) => {
            ArgValue::Str(String::from_utf8_lossy(value.as_bytes()).into_owned())
        }
        other => ArgValue::Str(format!("{other:?}")),
    }
}
