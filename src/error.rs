use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The broker could not be reached when opening a client handle.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The producer's local outbound queue is at capacity.
    #[error("Producer queue is full")]
    QueueFull,

    #[error("Publish error: {0}")]
    Publish(String),

    /// An error the broker attached to a polled message.
    #[error("Broker reported error: {0}")]
    BrokerReported(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Serialization(err.to_string())
    }
}

impl From<prometheus::Error> for BridgeError {
    fn from(err: prometheus::Error) -> Self {
        BridgeError::Metrics(err.to_string())
    }
}

impl From<config::ConfigError> for BridgeError {
    fn from(err: config::ConfigError) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl BridgeError {
    /// Static label used in log fields.
    pub fn category(&self) -> &'static str {
        match self {
            BridgeError::Connection(_) => "connection",
            BridgeError::QueueFull => "queue_full",
            BridgeError::Publish(_) => "publish",
            BridgeError::BrokerReported(_) => "broker",
            BridgeError::Serialization(_) | BridgeError::Deserialization(_) => "serialization",
            BridgeError::IllegalState(_) => "illegal_state",
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::Config(_) | BridgeError::InvalidConfig(_) => "configuration",
            BridgeError::Io(_) => "io",
            BridgeError::Metrics(_) => "metrics",
        }
    }

    /// Transient conditions that a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::QueueFull
                | BridgeError::Timeout { .. }
                | BridgeError::Connection(_)
                | BridgeError::BrokerReported(_)
        )
    }
}
