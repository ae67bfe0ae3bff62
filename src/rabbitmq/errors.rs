// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

use super::connection::ConnectionState;
use super::topology::TopologyItem;

#[derive(Debug, Clone, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ reconnect gave up after {attempts} attempt(s): {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("Not connected to RabbitMQ (state: {0})")]
    NotConnected(ConnectionState),

    #[error("Failed to declare {item}: {cause}")]
    DeclarationError {
        item: TopologyItem,
        #[source]
        cause: Box<RabbitMQError>,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(String),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    pub(crate) fn declaration(item: TopologyItem, cause: RabbitMQError) -> Self {
        RabbitMQError::DeclarationError {
            item,
            cause: Box::new(cause),
        }
    }

    /// True for dial/channel-open failures and for reconnect exhaustion.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_) | RabbitMQError::ReconnectExhausted { .. }
        )
    }

    /// True when the operation was refused because the manager had no live channel,
    /// including batch declaration entries that wrap that condition.
    pub fn is_not_connected(&self) -> bool {
        match self {
            RabbitMQError::NotConnected(_) => true,
            RabbitMQError::DeclarationError { cause, .. } => cause.is_not_connected(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RabbitMQError::Cancelled(_))
    }

    /// The topology item a declaration error is attributed to.
    pub fn declaration_item(&self) -> Option<&TopologyItem> {
        match self {
            RabbitMQError::DeclarationError { item, .. } => Some(item),
            _ => None,
        }
    }
}

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        // Use string representation for classification
        let error_text = error.to_string();
        let lowered = error_text.to_lowercase();

        if lowered.contains("connection") || lowered.contains("io error") {
            RabbitMQError::ConnectionError(error_text)
        } else if lowered.contains("channel") {
            RabbitMQError::ChannelError(error_text)
        } else if lowered.contains("publish") {
            RabbitMQError::PublishError(error_text)
        } else if lowered.contains("consume") {
            RabbitMQError::ConsumeError(error_text)
        } else if lowered.contains("ack") {
            RabbitMQError::AckError(error_text)
        } else {
            RabbitMQError::Unknown(error_text)
        }
    }
}

impl From<SerdeError> for RabbitMQError {
    fn from(error: SerdeError) -> Self {
        RabbitMQError::SerializationError(error.to_string())
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::ConnectionError("Connection timed out".to_string())
    }
}
