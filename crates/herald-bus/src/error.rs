//! Error types for the event channel.

use herald_core::error::HeraldError;

/// Errors returned to publishers and subscribers.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The queue is at capacity. Only returned by `try_publish`.
    #[error("Event channel is full (capacity {0})")]
    Full(usize),
    #[error("Event channel is closed")]
    Closed,
    #[error("Event channel is already running")]
    AlreadyRunning,
    #[error("Invalid topic pattern: {0}")]
    InvalidTopic(String),
    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<BusError> for HeraldError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Closed => HeraldError::ShuttingDown,
            other => HeraldError::Bus(other.to_string()),
        }
    }
}

/// Failure reported by an event handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self(format!("payload decode failed: {}", err))
    }
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        Self(err.to_string())
    }
}
