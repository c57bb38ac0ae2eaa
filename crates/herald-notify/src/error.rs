//! Error types for notification scheduling.

use herald_bus::BusError;
use herald_core::error::HeraldError;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Invalid quiet-hours policy: {0}")]
    InvalidPolicy(String),
    #[error("Event channel error: {0}")]
    Bus(#[from] BusError),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for NotifyError {
    fn from(err: serde_json::Error) -> Self {
        NotifyError::Serialization(err.to_string())
    }
}

impl From<NotifyError> for HeraldError {
    fn from(err: NotifyError) -> Self {
        match err {
            NotifyError::Bus(bus) => bus.into(),
            other => HeraldError::Notification(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_to_herald_error() {
        let err: HeraldError = NotifyError::InvalidPolicy("25:00".into()).into();
        assert!(matches!(err, HeraldError::Notification(_)));
        assert!(err.to_string().contains("25:00"));

        let err: HeraldError = NotifyError::Bus(BusError::Closed).into();
        assert!(matches!(err, HeraldError::ShuttingDown));
    }
}
