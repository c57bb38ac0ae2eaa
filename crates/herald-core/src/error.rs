use thiserror::Error;

/// Top-level error type for the Herald system.
///
/// Subsystem crates define their own error types and implement
/// `From<SubsystemError> for HeraldError` so that `?` works across crate
/// boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HeraldError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Event channel error: {0}")]
    Bus(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Coordinator error: {0}")]
    Coordinator(String),

    #[error("Learning error: {0}")]
    Learning(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<toml::de::Error> for HeraldError {
    fn from(err: toml::de::Error) -> Self {
        HeraldError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for HeraldError {
    fn from(err: toml::ser::Error) -> Self {
        HeraldError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for HeraldError {
    fn from(err: serde_json::Error) -> Self {
        HeraldError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Herald operations.
pub type Result<T> = std::result::Result<T, HeraldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HeraldError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");

        let err = HeraldError::Routing("unknown target".to_string());
        assert_eq!(err.to_string(), "Routing error: unknown target");

        assert_eq!(HeraldError::ShuttingDown.to_string(), "Shutdown in progress");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: HeraldError = io_err.into();
        assert!(matches!(err, HeraldError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: HeraldError = json_err.into();
        assert!(matches!(err, HeraldError::Serialization(_)));
    }

    #[test]
    fn test_toml_error_conversion() {
        let toml_err = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let err: HeraldError = toml_err.into();
        assert!(matches!(err, HeraldError::Config(_)));
    }
}
