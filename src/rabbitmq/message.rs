// src/rabbitmq/message.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::errors::{RabbitMQError, Result};
use super::topology::{ArgValue, Arguments};
use super::transport::Acknowledger;

/// Default per-call publish deadline.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// An outgoing message. Built once, then only read.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    body: Vec<u8>,
    content_type: String,
    headers: Arguments,
    correlation_id: Option<String>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            content_type: String::new(),
            headers: Arguments::new(),
            correlation_id: None,
        }
    }

    /// Serializes `value` as the body and sets `application/json`.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(body).with_content_type("application/json"))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn headers(&self) -> &Arguments {
        &self.headers
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }
}

/// Where and how a message is published.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerConfig {
    /// Empty targets the default exchange.
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub timeout: Duration,
}

impl ProducerConfig {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            ..Self::default()
        }
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            exchange: String::new(),
            routing_key: String::new(),
            mandatory: false,
            immediate: false,
            timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

/// Subscription parameters for one consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerConfig {
    pub queue: String,
    /// Empty means a fresh `consumer-<uuid>` tag on every subscribe.
    pub consumer_tag: String,
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    /// 0 leaves the channel unlimited.
    pub prefetch_count: u16,
    pub arguments: Arguments,
}

impl ConsumerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }
}

/// One message handed to a consumer callback.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub content_type: Option<String>,
    pub headers: Arguments,
    pub correlation_id: Option<String>,
    pub data: Vec<u8>,
    acker: Option<Arc<dyn Acknowledger>>,
}

impl Delivery {
    /// `acker` is `None` for deliveries the broker already considers acknowledged.
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        data: Vec<u8>,
        acker: Option<Arc<dyn Acknowledger>>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered: false,
            content_type: None,
            headers: Arguments::new(),
            correlation_id: None,
            data,
            acker,
        }
    }

    pub fn is_auto_acked(&self) -> bool {
        self.acker.is_none()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data)
            .map_err(|e| RabbitMQError::DeserializationError(e.to_string()))
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker()?.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker()?.nack(requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker()?.reject(requeue).await
    }

    fn acker(&self) -> Result<&Arc<dyn Acknowledger>> {
        self.acker.as_ref().ok_or_else(|| {
            RabbitMQError::AckError(format!(
                "delivery {} was auto-acknowledged",
                self.delivery_tag
            ))
        })
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("content_type", &self.content_type)
            .field("correlation_id", &self.correlation_id)
            .field("len", &self.data.len())
            .field("auto_acked", &self.is_auto_acked())
            .finish()
    }
}
