//! Process configuration.
//!
//! Every section has sensible defaults and a `validate()`; [`MeshConfig`]
//! can be loaded from `MESH_*` environment variables.
//!
//! # Example
//!
//! ```no_run
//! use meshbus_core::config::MeshConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MeshConfig::from_env()?;
//! println!("brokers: {}", config.broker.brokers);
//! # Ok(())
//! # }
//! ```

use crate::topic::TopicNamer;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required variable is missing.
    #[error("Configuration missing: {var}")]
    Missing {
        /// Variable name.
        var: String,
    },

    /// Variable could not be parsed.
    #[error("Configuration invalid for {var}: {reason}")]
    Invalid {
        /// Variable name.
        var: String,
        /// What is wrong.
        reason: String,
    },

    /// Values parse but are inconsistent.
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Security protocol for the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityProtocol {
    /// No encryption, no auth.
    #[default]
    Plaintext,
    /// TLS without SASL.
    Ssl,
    /// SASL without TLS.
    SaslPlaintext,
    /// SASL over TLS.
    SaslSsl,
}

impl SecurityProtocol {
    /// Client configuration value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plaintext => "PLAINTEXT",
            Self::Ssl => "SSL",
            Self::SaslPlaintext => "SASL_PLAINTEXT",
            Self::SaslSsl => "SASL_SSL",
        }
    }

    /// Whether SASL credentials are required.
    #[must_use]
    pub const fn uses_sasl(self) -> bool {
        matches!(self, Self::SaslPlaintext | Self::SaslSsl)
    }
}

impl FromStr for SecurityProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PLAINTEXT" => Ok(Self::Plaintext),
            "SSL" => Ok(Self::Ssl),
            "SASL_PLAINTEXT" => Ok(Self::SaslPlaintext),
            "SASL_SSL" => Ok(Self::SaslSsl),
            _ => Err(ConfigError::Invalid {
                var: "MESH_SECURITY_PROTOCOL".to_string(),
                reason: format!("unknown protocol: {s}"),
            }),
        }
    }
}

/// SASL credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct SaslCredentials {
    /// `PLAIN`, `SCRAM-SHA-256` or `SCRAM-SHA-512`.
    pub mechanism: String,
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

impl std::fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("mechanism", &self.mechanism)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Comma-separated bootstrap servers.
    pub brokers: String,
    /// Client identifier.
    pub client_id: String,
    /// Consumer group for reply and request consumers.
    pub consumer_group: String,
    /// Deployment-scoped topic prefix.
    pub topic_prefix: Option<String>,
    /// Per-call reply timeout.
    pub request_timeout: Duration,
    /// How long a produced message may wait for broker acknowledgment.
    pub send_timeout: Duration,
    /// Security protocol.
    pub security_protocol: SecurityProtocol,
    /// SASL credentials (required for SASL protocols).
    pub sasl: Option<SaslCredentials>,
    /// CA bundle for TLS.
    pub ssl_ca_location: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: "meshbus".to_string(),
            consumer_group: "meshbus".to_string(),
            topic_prefix: None,
            request_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(5),
            security_protocol: SecurityProtocol::Plaintext,
            sasl: None,
            ssl_ca_location: None,
        }
    }
}

impl BrokerConfig {
    /// Topic namer for the configured prefix.
    #[must_use]
    pub fn topic_namer(&self) -> TopicNamer {
        TopicNamer::new(self.topic_prefix.clone())
    }

    /// Validate broker settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if settings are inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.trim().is_empty() {
            return Err(ConfigError::Validation("brokers cannot be empty".to_string()));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(ConfigError::Validation(
                "consumer_group cannot be empty".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "request_timeout must be > 0".to_string(),
            ));
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::Validation("send_timeout must be > 0".to_string()));
        }
        if self.security_protocol.uses_sasl() && self.sasl.is_none() {
            return Err(ConfigError::Validation(format!(
                "{} requires SASL credentials",
                self.security_protocol.as_str()
            )));
        }
        Ok(())
    }
}

/// Topic provisioning defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningConfig {
    /// Partitions for new topics, and the floor for existing ones.
    pub default_partitions: i32,
    /// Replication factor for new topics.
    pub replication_factor: i32,
    /// Bound on waiting for partition leaders after creation.
    pub leader_wait: Duration,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            default_partitions: 1,
            replication_factor: 1,
            leader_wait: Duration::from_secs(120),
        }
    }
}

impl ProvisioningConfig {
    /// Validate provisioning settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for non-positive counts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_partitions < 1 {
            return Err(ConfigError::Validation(
                "default_partitions must be >= 1".to_string(),
            ));
        }
        if self.replication_factor < 1 {
            return Err(ConfigError::Validation(
                "replication_factor must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outbox flush tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxConfig {
    /// Events emitted concurrently per chunk.
    pub chunk_size: usize,
    /// Pause between chunks.
    pub chunk_delay: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            chunk_delay: Duration::from_millis(100),
        }
    }
}

impl OutboxConfig {
    /// Validate outbox settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `chunk_size` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Validation("chunk_size must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Lease manager defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Lease length.
    pub lease_timeout: Duration,
    /// How often a held lease is renewed.
    pub refresh_interval: Duration,
    /// First delay between acquire attempts.
    pub acquire_retry_delay: Duration,
    /// Cap on the delay between acquire attempts.
    pub max_acquire_delay: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(10),
            acquire_retry_delay: Duration::from_millis(200),
            max_acquire_delay: Duration::from_secs(2),
        }
    }
}

impl LeaseConfig {
    /// Validate lease settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the lease would expire before
    /// its first refresh.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::Validation(
                "refresh_interval must be > 0".to_string(),
            ));
        }
        if self.refresh_interval >= self.lease_timeout {
            return Err(ConfigError::Validation(
                "refresh_interval must be shorter than lease_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    /// Default log level when `RUST_LOG` is unset.
    pub log_level: String,
    /// Install the Prometheus recorder.
    pub metrics_enabled: bool,
    /// Address the metrics endpoint is served on.
    pub metrics_addr: SocketAddr,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl ObservabilityConfig {
    /// Validate observability settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for an unknown log level.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "invalid log_level: {}. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }
        Ok(())
    }
}

/// Complete process configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshConfig {
    /// Broker connection.
    pub broker: BrokerConfig,
    /// Topic provisioning.
    pub provisioning: ProvisioningConfig,
    /// Outbox flushing.
    pub outbox: OutboxConfig,
    /// Lease manager.
    pub lease: LeaseConfig,
    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

impl MeshConfig {
    /// Load from the process environment.
    ///
    /// Required: `MESH_BROKERS`. Everything else is optional:
    /// `MESH_CLIENT_ID`, `MESH_CONSUMER_GROUP`, `MESH_TOPIC_PREFIX`,
    /// `MESH_REQUEST_TIMEOUT_MS`, `MESH_SECURITY_PROTOCOL`,
    /// `MESH_SASL_MECHANISM`, `MESH_SASL_USERNAME`, `MESH_SASL_PASSWORD`,
    /// `MESH_SSL_CA_LOCATION`, `MESH_DEFAULT_PARTITIONS`,
    /// `MESH_REPLICATION_FACTOR`, `MESH_LEADER_WAIT_MS`,
    /// `MESH_OUTBOX_CHUNK_SIZE`, `MESH_OUTBOX_CHUNK_DELAY_MS`,
    /// `MESH_LEASE_TIMEOUT_MS`, `MESH_LEASE_REFRESH_MS`, `MESH_LOG_LEVEL`,
    /// `MESH_METRICS_ENABLED`, `MESH_METRICS_ADDR`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is missing, unparsable, or the
    /// result fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Same as [`from_env`](Self::from_env).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let brokers = lookup("MESH_BROKERS").ok_or_else(|| ConfigError::Missing {
            var: "MESH_BROKERS".to_string(),
        })?;

        let security_protocol = lookup("MESH_SECURITY_PROTOCOL")
            .map(|s| s.parse::<SecurityProtocol>())
            .transpose()?
            .unwrap_or_default();

        let sasl = match (
            lookup("MESH_SASL_USERNAME"),
            lookup("MESH_SASL_PASSWORD"),
        ) {
            (Some(username), Some(password)) => Some(SaslCredentials {
                mechanism: lookup("MESH_SASL_MECHANISM").unwrap_or_else(|| "PLAIN".to_string()),
                username,
                password,
            }),
            _ => None,
        };

        let broker = BrokerConfig {
            brokers,
            client_id: lookup("MESH_CLIENT_ID").unwrap_or(defaults.broker.client_id),
            consumer_group: lookup("MESH_CONSUMER_GROUP")
                .unwrap_or(defaults.broker.consumer_group),
            topic_prefix: lookup("MESH_TOPIC_PREFIX").filter(|p| !p.is_empty()),
            request_timeout: millis(&lookup, "MESH_REQUEST_TIMEOUT_MS")?
                .unwrap_or(defaults.broker.request_timeout),
            send_timeout: millis(&lookup, "MESH_SEND_TIMEOUT_MS")?
                .unwrap_or(defaults.broker.send_timeout),
            security_protocol,
            sasl,
            ssl_ca_location: lookup("MESH_SSL_CA_LOCATION"),
        };

        let provisioning = ProvisioningConfig {
            default_partitions: parsed(&lookup, "MESH_DEFAULT_PARTITIONS")?
                .unwrap_or(defaults.provisioning.default_partitions),
            replication_factor: parsed(&lookup, "MESH_REPLICATION_FACTOR")?
                .unwrap_or(defaults.provisioning.replication_factor),
            leader_wait: millis(&lookup, "MESH_LEADER_WAIT_MS")?
                .unwrap_or(defaults.provisioning.leader_wait),
        };

        let outbox = OutboxConfig {
            chunk_size: parsed(&lookup, "MESH_OUTBOX_CHUNK_SIZE")?
                .unwrap_or(defaults.outbox.chunk_size),
            chunk_delay: millis(&lookup, "MESH_OUTBOX_CHUNK_DELAY_MS")?
                .unwrap_or(defaults.outbox.chunk_delay),
        };

        let lease = LeaseConfig {
            lease_timeout: millis(&lookup, "MESH_LEASE_TIMEOUT_MS")?
                .unwrap_or(defaults.lease.lease_timeout),
            refresh_interval: millis(&lookup, "MESH_LEASE_REFRESH_MS")?
                .unwrap_or(defaults.lease.refresh_interval),
            ..defaults.lease
        };

        let observability = ObservabilityConfig {
            log_level: lookup("MESH_LOG_LEVEL").unwrap_or(defaults.observability.log_level),
            metrics_enabled: parsed(&lookup, "MESH_METRICS_ENABLED")?
                .unwrap_or(defaults.observability.metrics_enabled),
            metrics_addr: parsed(&lookup, "MESH_METRICS_ADDR")?
                .unwrap_or(defaults.observability.metrics_addr),
        };

        let config = Self {
            broker,
            provisioning,
            outbox,
            lease,
            observability,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns the first section error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.provisioning.validate()?;
        self.outbox.validate()?;
        self.lease.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

fn parsed<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var: var.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn millis<F>(lookup: &F, var: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parsed::<F, u64>(lookup, var)?.map(Duration::from_millis))
}
