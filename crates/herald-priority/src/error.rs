//! Error types for sender learning.

use herald_core::error::HeraldError;
use herald_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum LearningError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),
    #[error("Invalid sender identifier: {0:?}")]
    InvalidSender(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for LearningError {
    fn from(err: serde_json::Error) -> Self {
        LearningError::Serialization(err.to_string())
    }
}

impl From<LearningError> for HeraldError {
    fn from(err: LearningError) -> Self {
        HeraldError::Learning(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_and_conversion() {
        let err = LearningError::InvalidSender("  ".into());
        assert_eq!(err.to_string(), "Invalid sender identifier: \"  \"");

        let err: LearningError = StorageError::Timeout(500).into();
        assert!(err.to_string().contains("500 ms"));

        let err: HeraldError = err.into();
        assert!(matches!(err, HeraldError::Learning(_)));
    }
}
