//! Error types for backplane operations

use thiserror::Error;

/// Argument and construction errors. Always raised synchronously at the call site.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ValidationError {
    /// Shorthand for a blank or missing argument.
    pub fn missing(field: impl Into<String>) -> Self {
        Self::RequiredFieldMissing {
            field: field.into(),
        }
    }

    /// Shorthand for an argument that is present but unusable.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Backing store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store connection is closed")]
    ConnectionClosed,

    #[error("Write failed for {key}: {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("Read failed for {key}: {reason}")]
    ReadFailed { key: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Value codec failed for {key}: {reason}")]
    ValueCodec { key: String, reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

/// Pub/sub transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Topic {topic} is unavailable: {reason}")]
    TopicUnavailable { topic: String, reason: String },

    #[error("Publish to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Subscribe to {topic} failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },
}

/// Wire format errors raised while encoding or decoding a batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("Payload is empty")]
    Empty,

    #[error("Unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Message is missing its {field}")]
    MissingField { field: &'static str },

    #[error("Failed to encode batch: {0}")]
    Encode(String),
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all backplane errors.
#[derive(Debug, Clone, Error)]
pub enum BackplaneError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for backplane operations.
pub type BackplaneResult<T> = Result<T, BackplaneError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::missing("key");
        assert_eq!(err.to_string(), "Required field missing: key");

        let err = ValidationError::invalid("expiration", "timeout below 1ms");
        assert!(err.to_string().contains("timeout below 1ms"));
    }

    #[test]
    fn test_wire_error_display() {
        let err = WireError::MissingField { field: "key" };
        assert_eq!(err.to_string(), "Message is missing its key");

        let err = WireError::UnsupportedVersion(9);
        assert_eq!(err.to_string(), "Unsupported wire version 9");
    }

    #[test]
    fn test_master_error_from_conversions() {
        let err: BackplaneError = StoreError::ConnectionClosed.into();
        assert!(matches!(err, BackplaneError::Store(StoreError::ConnectionClosed)));
        assert!(err.to_string().starts_with("Store error:"));

        let err: BackplaneError = TransportError::PublishFailed {
            topic: "t".to_string(),
            reason: "down".to_string(),
        }
        .into();
        assert!(matches!(err, BackplaneError::Transport(_)));

        let err: BackplaneError = WireError::Empty.into();
        assert!(matches!(err, BackplaneError::Wire(WireError::Empty)));
    }
}
