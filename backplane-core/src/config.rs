//! Configuration types
//!
//! Configuration is loaded from environment variables with defaults that
//! match the wire expectations of existing deployments.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{is_blank, ConfigError};

/// Topic every backplane instance publishes to and subscribes on.
pub const DEFAULT_TOPIC_NAME: &str = "cacheManagerBackplane";

/// Time-to-live attached to every published batch.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(5);

// ============================================================================
// BACKPLANE CONFIGURATION
// ============================================================================

/// Backplane settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackplaneConfig {
    /// Name of the shared pub/sub topic.
    pub topic_name: String,

    /// Time-to-live of published batches. `None` lets the transport keep
    /// messages for as long as it likes.
    pub message_ttl: Option<Duration>,

    /// Human readable label used in log output only.
    pub node_label: Option<String>,
}

impl Default for BackplaneConfig {
    fn default() -> Self {
        Self {
            topic_name: DEFAULT_TOPIC_NAME.to_string(),
            message_ttl: Some(DEFAULT_MESSAGE_TTL),
            node_label: None,
        }
    }
}

impl BackplaneConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create BackplaneConfig from environment variables.
    ///
    /// Environment variables:
    /// - `BACKPLANE_TOPIC`: Topic name (default: cacheManagerBackplane)
    /// - `BACKPLANE_MESSAGE_TTL_MS`: Batch time-to-live in ms, 0 disables (default: 5000)
    /// - `BACKPLANE_NODE_LABEL`: Label for log output (default: unset)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(topic) = std::env::var("BACKPLANE_TOPIC") {
            config.topic_name = topic.trim().to_string();
        }

        if let Ok(raw) = std::env::var("BACKPLANE_MESSAGE_TTL_MS") {
            let millis: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "BACKPLANE_MESSAGE_TTL_MS".to_string(),
                value: raw.clone(),
                reason: "expected a whole number of milliseconds".to_string(),
            })?;
            config.message_ttl = (millis > 0).then(|| Duration::from_millis(millis));
        }

        config.node_label = std::env::var("BACKPLANE_NODE_LABEL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Set the topic name.
    pub fn with_topic(mut self, topic_name: impl Into<String>) -> Self {
        self.topic_name = topic_name.into();
        self
    }

    /// Set the message time-to-live.
    pub fn with_message_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.message_ttl = ttl;
        self
    }

    /// Set the node label.
    pub fn with_node_label(mut self, label: impl Into<String>) -> Self {
        self.node_label = Some(label.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if is_blank(&self.topic_name) {
            return Err(ConfigError::MissingRequired {
                field: "topic_name".to_string(),
            });
        }
        if self.message_ttl == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "message_ttl".to_string(),
                value: "0".to_string(),
                reason: "use None to disable the time-to-live".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// STORE CONFIGURATION
// ============================================================================

/// Settings for the LMDB backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the LMDB files.
    pub path: PathBuf,
    /// Maximum size of the memory map in megabytes.
    pub max_size_mb: usize,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size_mb: 64,
        }
    }

    /// Create StoreConfig from environment variables.
    ///
    /// Environment variables:
    /// - `BACKPLANE_STORE_PATH`: LMDB directory (required)
    /// - `BACKPLANE_STORE_MAX_SIZE_MB`: Map size in MB (default: 64)
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("BACKPLANE_STORE_PATH")
            .ok()
            .filter(|s| !is_blank(s))
            .ok_or_else(|| ConfigError::MissingRequired {
                field: "BACKPLANE_STORE_PATH".to_string(),
            })?;

        let mut config = Self::new(path);
        if let Ok(raw) = std::env::var("BACKPLANE_STORE_MAX_SIZE_MB") {
            config.max_size_mb = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "BACKPLANE_STORE_MAX_SIZE_MB".to_string(),
                value: raw.clone(),
                reason: "expected a whole number of megabytes".to_string(),
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the map size.
    pub fn with_max_size_mb(mut self, max_size_mb: usize) -> Self {
        self.max_size_mb = max_size_mb;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_size_mb".to_string(),
                value: "0".to_string(),
                reason: "map size must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backplane_config_defaults() {
        let config = BackplaneConfig::default();
        assert_eq!(config.topic_name, "cacheManagerBackplane");
        assert_eq!(config.message_ttl, Some(Duration::from_secs(5)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backplane_config_builder() {
        let config = BackplaneConfig::new()
            .with_topic("orders")
            .with_message_ttl(None)
            .with_node_label("node-a");

        assert_eq!(config.topic_name, "orders");
        assert_eq!(config.message_ttl, None);
        assert_eq!(config.node_label.as_deref(), Some("node-a"));
    }

    #[test]
    fn test_backplane_config_validation() {
        let blank = BackplaneConfig::new().with_topic("  ");
        assert!(matches!(
            blank.validate(),
            Err(ConfigError::MissingRequired { .. })
        ));

        let zero_ttl = BackplaneConfig::new().with_message_ttl(Some(Duration::ZERO));
        assert!(matches!(
            zero_ttl.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_store_config_validation() {
        let config = StoreConfig::new("/tmp/backplane").with_max_size_mb(0);
        assert!(config.validate().is_err());
        assert!(StoreConfig::new("/tmp/backplane").validate().is_ok());
    }
}
