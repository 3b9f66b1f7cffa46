use std::time::Duration;

use serde::Deserialize;
use switchyard_config::{ConfigurationError, GenericConfiguration};

const fn default_requests() -> usize {
    1
}

const fn default_interval_ms() -> u64 {
    1_000
}

fn default_path() -> String {
    "/".to_string()
}

/// Protocol used by the probe.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    /// Raw TCP request/response.
    Tcp,

    /// Single UDP datagram per request.
    Udp,

    /// HTTP/1.1 `POST`, or `GET` when the payload is empty.
    Http,

    /// Server-sent event stream.
    Sse,
}

/// Probe settings.
///
/// These are read from the same configuration as the client itself, so a single file describes both what to talk to
/// and what to send.
#[derive(Clone, Debug, Deserialize)]
pub struct ProbeConfig {
    /// Protocol to probe with.
    pub protocol: ProbeProtocol,

    /// Payload sent with every request.
    #[serde(default)]
    pub payload: String,

    /// Request path, for HTTP and SSE.
    #[serde(default = "default_path")]
    pub path: String,

    /// Number of requests to send before exiting.
    #[serde(default = "default_requests")]
    pub requests: usize,

    /// Delay between requests, in milliseconds.
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
}

impl ProbeConfig {
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, ConfigurationError> {
        let probe_config = config.as_typed::<Self>()?;
        if probe_config.requests == 0 {
            return Err(ConfigurationError::invalid_value("requests", "must be at least 1"));
        }
        Ok(probe_config)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}
