// src/lib.rs
//! Resilient RabbitMQ connection and topology management on top of lapin.

pub mod config;
pub mod env;
pub mod rabbitmq;

pub use rabbitmq::{
    ConnectionConfig, ConnectionManager, ConnectionState, Consumer, FailureObserver, Producer,
    RabbitMQError, Result, TopologyDeclarator,
};
