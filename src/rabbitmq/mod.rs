// src/rabbitmq/mod.rs
// Connection lifecycle, topology declaration and pub/consume over RabbitMQ

pub mod errors;
pub mod topology;
pub mod message;
pub mod transport;
pub mod connection;
pub mod declarator;
pub mod publisher;
pub mod consumer;
pub mod memory;

// lapin-backed transport
mod amqp_client;

pub use amqp_client::LapinConnector;
pub use connection::{
    ChannelHandle, ConnectionConfig, ConnectionManager, ConnectionState, FailureObserver,
    LogFailures, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_MAX_RECONNECT_TIMES, DEFAULT_STABLE_AFTER,
};
pub use consumer::{handler_fn, BoxError, Consumer, ConsumerHandle, DeliveryHandler, Subscription};
pub use declarator::TopologyDeclarator;
pub use errors::{RabbitMQError, Result};
pub use transport::CloseReason;
pub use memory::MemoryBroker;
pub use message::{ConsumerConfig, Delivery, Message, ProducerConfig, DEFAULT_PUBLISH_TIMEOUT};
pub use publisher::Producer;
pub use topology::{
    ArgValue, Arguments, BindSpec, ExchangeKind, ExchangeSpec, QueueInfo, QueueSpec, TopologyItem,
    TopologySpec,
};
