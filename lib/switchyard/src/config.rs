//! Per-client configuration.

use std::time::Duration;

use serde::Deserialize;
use switchyard_config::{ConfigurationError, GenericConfiguration};

use crate::endpoint::Endpoint;

const fn default_max_connections_per_endpoint() -> usize {
    50
}

const fn default_connect_timeout_ms() -> u64 {
    2_000
}

const fn default_read_timeout_ms() -> u64 {
    5_000
}

const fn default_max_retries() -> u32 {
    1
}

const fn default_idle_connection_timeout_ms() -> u64 {
    30_000
}

const fn default_pool_cleaner_interval_ms() -> u64 {
    5_000
}

fn default_client_name() -> String {
    "default".to_string()
}

/// Configuration for a single client.
///
/// Every field has a default, so an empty configuration source yields a usable value. The configuration is read-only
/// once handed to the factory: each constructed client keeps its own copy.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ClientConfiguration {
    /// Name used to identify the client in logs and metrics.
    ///
    /// Defaults to `default`.
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Static list of backend endpoints, as `host:port`.
    ///
    /// Used to derive a load balancer when none is supplied. Defaults to empty.
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Maximum number of idle connections kept per endpoint.
    ///
    /// Defaults to 50.
    #[serde(default = "default_max_connections_per_endpoint")]
    pub max_connections_per_endpoint: usize,

    /// Timeout for establishing a connection, in milliseconds.
    ///
    /// Defaults to 2000.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for receiving a response, in milliseconds.
    ///
    /// Defaults to 5000.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Number of retries against the same endpoint before moving on.
    ///
    /// Defaults to 0.
    #[serde(default)]
    pub max_retries_same_endpoint: u32,

    /// Number of retries against a different endpoint, chosen by the load balancer.
    ///
    /// Defaults to 1.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How long a pooled connection may sit idle before it is evicted, in milliseconds.
    ///
    /// Defaults to 30000.
    #[serde(default = "default_idle_connection_timeout_ms")]
    pub idle_connection_timeout_ms: u64,

    /// How often the pool maintenance task sweeps this client's pool, in milliseconds.
    ///
    /// Defaults to 5000.
    #[serde(default = "default_pool_cleaner_interval_ms")]
    pub pool_cleaner_interval_ms: u64,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        Self {
            client_name: default_client_name(),
            endpoints: Vec::new(),
            max_connections_per_endpoint: default_max_connections_per_endpoint(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            max_retries_same_endpoint: 0,
            max_retries: default_max_retries(),
            idle_connection_timeout_ms: default_idle_connection_timeout_ms(),
            pool_cleaner_interval_ms: default_pool_cleaner_interval_ms(),
        }
    }
}

impl ClientConfiguration {
    /// Extracts and validates a `ClientConfiguration` from a generic configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized, or any value is invalid, an error will be returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, ConfigurationError> {
        let client_config = config.as_typed::<Self>()?;
        client_config.validate()?;
        Ok(client_config)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending field: an empty client name, a zero pool size, timeout or sweep
    /// interval, or an endpoint that is not a valid `host:port`.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.client_name.trim().is_empty() {
            return Err(ConfigurationError::invalid_value("client_name", "must not be empty"));
        }

        let positive = [
            ("max_connections_per_endpoint", self.max_connections_per_endpoint as u64),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("idle_connection_timeout_ms", self.idle_connection_timeout_ms),
            ("pool_cleaner_interval_ms", self.pool_cleaner_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(field, "must be greater than zero"));
            }
        }

        self.parsed_endpoints().map(|_| ())
    }

    /// Parses the configured endpoint list.
    ///
    /// # Errors
    ///
    /// If any entry is not a valid `host:port`, an error will be returned.
    pub fn parsed_endpoints(&self) -> Result<Vec<Endpoint>, ConfigurationError> {
        self.endpoints
            .iter()
            .map(|raw| {
                raw.parse::<Endpoint>()
                    .map_err(|reason| ConfigurationError::invalid_value("endpoints", format!("'{}': {}", raw, reason)))
            })
            .collect()
    }

    /// Returns the connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns the read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Returns the idle connection timeout.
    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_connection_timeout_ms)
    }

    /// Returns the pool sweep interval.
    pub fn pool_cleaner_interval(&self) -> Duration {
        Duration::from_millis(self.pool_cleaner_interval_ms)
    }
}
