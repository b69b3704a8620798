use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::types::DEFAULT_GROUP_ID;

/// Environment prefix for overrides, e.g. `DOCBRIDGE__PUBLISHER__ADDRESS`.
pub const ENV_PREFIX: &str = "DOCBRIDGE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub log_level: String,
    pub publisher: PublisherConfig,
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Broker connection string, `host:port[,host:port...]`.
    pub address: String,
    pub flush_timeout_ms: u64,
    /// Upper bound on messages buffered locally before `QueueFull`.
    pub queue_capacity: usize,
    pub connect_timeout_ms: u64,
    pub retry: RetryPolicy,
}

/// Bounded wait-and-retry applied when the producer queue is full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total submission attempts, including the first one.
    pub max_attempts: u32,
    /// How long to wait for queue space between attempts.
    pub wait_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub address: String,
    pub group_id: String,
    pub poll_timeout_ms: u64,
    pub offset_reset: OffsetReset,
    pub on_deserialization_error: DeserializationPolicy,
    pub connect_timeout_ms: u64,
}

/// Where a consumer group without a committed offset starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

/// What the receive loop does with a payload it cannot decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeserializationPolicy {
    /// Log, count and move on to the next message.
    #[default]
    Skip,
    /// Stop the loop and surface the error from `start()`.
    Fail,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            publisher: PublisherConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            address: "localhost:9092".to_string(),
            flush_timeout_ms: 30_000,
            queue_capacity: 100_000,
            connect_timeout_ms: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            wait_ms: 10_000,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            address: "localhost:9092".to_string(),
            group_id: DEFAULT_GROUP_ID.to_string(),
            poll_timeout_ms: 1_000,
            offset_reset: OffsetReset::default(),
            on_deserialization_error: DeserializationPolicy::default(),
            connect_timeout_ms: 5_000,
        }
    }
}

impl BridgeConfig {
    /// Load from an optional TOML file, then apply `DOCBRIDGE__*` overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut builder = config::Config::builder();

        if !path.as_os_str().is_empty() {
            builder = builder.add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Toml)
                    .required(false),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: BridgeConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without environment overrides.
    pub fn parse(content: &str) -> Result<Self> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_level.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                "log_level cannot be empty".to_string(),
            ));
        }
        self.publisher.validate()?;
        self.dispatcher.validate()?;
        Ok(())
    }
}

impl PublisherConfig {
    pub fn with_address<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_address("publisher.address", &self.address)?;
        self.retry.validate()?;

        if self.flush_timeout_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "publisher.flush_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(BridgeError::InvalidConfig(
                "publisher.queue_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts,
            wait_ms: wait.as_millis() as u64,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(BridgeError::InvalidConfig(
                "publisher.retry.max_attempts must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

impl DispatcherConfig {
    pub fn with_address<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_address("dispatcher.address", &self.address)?;

        if self.group_id.trim().is_empty() {
            return Err(BridgeError::InvalidConfig(
                "dispatcher.group_id cannot be empty".to_string(),
            ));
        }

        if self.poll_timeout_ms == 0 {
            return Err(BridgeError::InvalidConfig(
                "dispatcher.poll_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Accepts `host:port` entries separated by commas.
fn validate_address(key: &str, address: &str) -> Result<()> {
    if address.trim().is_empty() {
        return Err(BridgeError::InvalidConfig(format!("{} cannot be empty", key)));
    }

    for entry in address.split(',').map(str::trim) {
        let valid = match entry.rsplit_once(':') {
            Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
            None => false,
        };
        if !valid {
            return Err(BridgeError::InvalidConfig(format!(
                "{} entry '{}' must be in host:port form",
                key, entry
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.publisher.retry.max_attempts, 2);
        assert_eq!(config.publisher.retry.wait(), Duration::from_secs(10));
        assert_eq!(config.dispatcher.group_id, "kafka-bluesky");
        assert_eq!(config.dispatcher.offset_reset, OffsetReset::Latest);
        assert_eq!(config.dispatcher.poll_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_address_validation() {
        assert!(validate_address("a", "localhost:9092").is_ok());
        assert!(validate_address("a", "broker1:9092, broker2:9093").is_ok());

        for bad in ["", "localhost", ":9092", "localhost:port", "host:70000", "h:1,"] {
            let result = validate_address("a", bad);
            assert!(result.is_err(), "expected '{}' to be rejected", bad);
        }
    }

    #[test]
    fn test_validation_failures() {
        let mut config = BridgeConfig::default();
        config.publisher.retry.max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_attempts must be greater than 0"));

        let mut config = BridgeConfig::default();
        config.publisher.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::default();
        config.dispatcher.group_id = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("group_id cannot be empty"));

        let mut config = BridgeConfig::default();
        config.dispatcher.poll_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = BridgeConfig::parse(
            r#"
            [publisher]
            address = "kafka:29092"

            [publisher.retry]
            max_attempts = 3
            wait_ms = 500

            [dispatcher]
            group_id = "viewer"
            offset_reset = "earliest"
            on_deserialization_error = "fail"
            "#,
        )
        .unwrap();

        assert_eq!(config.publisher.address, "kafka:29092");
        assert_eq!(config.publisher.retry, RetryPolicy::new(3, Duration::from_millis(500)));
        assert_eq!(config.publisher.flush_timeout_ms, 30_000);
        assert_eq!(config.dispatcher.address, "localhost:9092");
        assert_eq!(config.dispatcher.offset_reset, OffsetReset::Earliest);
        assert_eq!(
            config.dispatcher.on_deserialization_error,
            DeserializationPolicy::Fail
        );
    }

    #[test]
    fn test_parse_rejects_invalid_values() {
        let result = BridgeConfig::parse("[dispatcher]\naddress = \"nowhere\"\n");
        assert!(matches!(result, Err(BridgeError::InvalidConfig(_))));

        let result = BridgeConfig::parse("[dispatcher]\noffset_reset = \"middle\"\n");
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "log_level = \"debug\"\n[publisher]\nqueue_capacity = 8").unwrap();

        let config = BridgeConfig::load(file.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.publisher.queue_capacity, 8);

        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = BridgeConfig::default();
        let encoded = toml::to_string(&config).unwrap();
        let decoded = BridgeConfig::parse(&encoded).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_policy_defaults_follow_live_tailing() {
        assert_eq!(OffsetReset::default(), OffsetReset::Latest);
        assert_eq!(DeserializationPolicy::default(), DeserializationPolicy::Skip);

        let config = BridgeConfig::parse("[dispatcher]\ngroup_id = \"analysis\"\n").unwrap();
        assert_eq!(config.dispatcher.offset_reset, OffsetReset::Latest);
        assert_eq!(config.dispatcher.on_deserialization_error, DeserializationPolicy::Skip);
    }
}
