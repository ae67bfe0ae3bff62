// src/rabbitmq/transport.rs
// The broker client seam: the lapin-backed client and the in-memory broker both implement it

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::watch;

use super::errors::Result;
use super::message::{ConsumerConfig, Delivery, Message, ProducerConfig};
use super::topology::{BindSpec, ExchangeSpec, QueueInfo, QueueSpec};

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Why a connection or channel went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub text: String,
    /// The broker closed the channel over one of our own commands (an AMQP
    /// soft error). The connection underneath is unaffected.
    pub channel_exception: bool,
}

impl CloseReason {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            channel_exception: false,
        }
    }

    pub fn channel_exception(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            channel_exception: true,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<String> for CloseReason {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<&str> for CloseReason {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// Opens transport connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    fn is_open(&self) -> bool;

    /// Resolves with the close reason once the connection is gone, whoever closed it.
    async fn closed(&self) -> CloseReason;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Resolves with the close reason once the channel is gone, whoever closed it.
    async fn closed(&self) -> CloseReason;

    async fn close(&self) -> Result<()>;

    async fn confirm_select(&self) -> Result<()>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<()>;

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueInfo>;

    async fn queue_bind(&self, queue: &str, bind: &BindSpec) -> Result<()>;

    /// Sends exactly one publish; with confirms on, waits for the broker's answer.
    async fn basic_publish(&self, config: &ProducerConfig, message: &Message) -> Result<()>;

    async fn basic_consume(
        &self,
        config: &ConsumerConfig,
        consumer_tag: &str,
    ) -> Result<DeliveryStream>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;
}

/// Settles one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// One-shot close notification shared by a transport handle and its watchers.
/// The first reason recorded wins.
#[derive(Clone)]
pub(crate) struct CloseSignal(Arc<watch::Sender<Option<CloseReason>>>);

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self(Arc::new(tx))
    }

    pub(crate) fn close(&self, reason: impl Into<CloseReason>) -> bool {
        self.0.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.into());
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.0.borrow().is_some()
    }

    pub(crate) async fn closed(&self) -> CloseReason {
        let mut rx = self.0.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::new("close signal dropped");
            }
        }
    }
}
