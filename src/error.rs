// MIT License - Copyright (c) 2026 Peter Wright
// Error taxonomy

/// All errors that can occur in the zigbee-lights library.
#[derive(Debug, thiserror::Error)]
pub enum LightsError {
    #[error("Broker connection failed: {reason}")]
    Connection { reason: String },

    #[error("Broker connection timeout")]
    ConnectionTimeout,

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Failed to unsubscribe from {topic}: {reason}")]
    Unsubscribe { topic: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No discovery snapshot received on {topic}")]
    DiscoveryTimeout { topic: String },

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("Healing aborted for circuit {circuit}: {reason}")]
    HealingAborted { circuit: String, reason: String },
}

impl LightsError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Whether this error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LightsError::ConnectionTimeout
                | LightsError::NotConnected
                | LightsError::Publish { .. }
                | LightsError::Subscribe { .. }
                | LightsError::Unsubscribe { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LightsError>;
