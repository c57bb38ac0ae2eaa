//! Error types for the persistence boundary.

use herald_core::error::HeraldError;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backing store cannot be reached right now; callers may retry.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Storage operation timed out after {0} ms")]
    Timeout(u64),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Timeout(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StorageError::Unavailable(err.to_string())
            }
            _ => StorageError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<StorageError> for HeraldError {
    fn from(err: StorageError) -> Self {
        HeraldError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Unavailable("down".into()).is_transient());
        assert!(StorageError::Timeout(500).is_transient());
        assert!(!StorageError::Database("constraint".into()).is_transient());
        assert!(!StorageError::Serialization("bad".into()).is_transient());
    }

    #[test]
    fn test_display_and_conversion() {
        let err = StorageError::Timeout(500);
        assert_eq!(err.to_string(), "Storage operation timed out after 500 ms");
        let err: HeraldError = StorageError::Database("disk full".into()).into();
        assert!(matches!(err, HeraldError::Storage(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
