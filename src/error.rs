use thiserror::Error;

#[derive(Error, Debug)]
pub enum RowQueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("UUID parsing error: {0}")]
    UuidParsing(#[from] uuid::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Subscription error: {message}")]
    Subscription { message: String },

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaVersion { expected: String, found: String },

    #[error("Queue is not ready. Use start() or connect() first")]
    NotReady,

    #[error("start() has already been called on this queue")]
    AlreadyStarted,

    #[error("Queue is not started. Use start() first")]
    NotStarted,

    #[error("Queue connection pool has been closed. Create a new JobQueue")]
    Closed,

    #[error("Store error: {message}")]
    Store { message: String },
}

impl RowQueueError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        RowQueueError::Validation {
            message: message.into(),
        }
    }

    /// Whether this error was raised before any statement reached the store.
    pub fn is_validation(&self) -> bool {
        matches!(self, RowQueueError::Validation { .. })
    }
}

impl From<toml::de::Error> for RowQueueError {
    fn from(err: toml::de::Error) -> Self {
        RowQueueError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for RowQueueError {
    fn from(err: toml::ser::Error) -> Self {
        RowQueueError::Config(format!("TOML serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let validation = RowQueueError::validation("retry_limit must be an integer >= 0");
        assert_eq!(
            validation.to_string(),
            "Validation error: retry_limit must be an integer >= 0"
        );
        assert!(validation.is_validation());

        let version = RowQueueError::SchemaVersion {
            expected: "1".to_string(),
            found: "0".to_string(),
        };
        assert_eq!(
            version.to_string(),
            "Schema version mismatch: expected 1, found 0"
        );
        assert!(!version.is_validation());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json");
        assert!(json_error.is_err());

        let error: RowQueueError = json_error.unwrap_err().into();
        assert!(matches!(error, RowQueueError::Serialization(_)));
    }

    #[test]
    fn test_error_from_toml() {
        let toml_error = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let error: RowQueueError = toml_error.into();
        assert!(matches!(error, RowQueueError::Config(_)));
        assert!(error.to_string().contains("TOML deserialization error"));
    }
}
