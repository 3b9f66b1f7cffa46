use crate::config::ClientConfiguration;

use super::{FailureKind, RetryPolicy};

/// The default retry policy for connection-oriented and datagram clients.
///
/// Connection failures (refused, timed out, closed mid-response) and read timeouts are retried, first against the same
/// endpoint and then against other endpoints, within the configured budgets. Error statuses and decoding failures are
/// considered permanent and abort immediately.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancedRetryPolicy {
    max_retries_same_endpoint: u32,
    max_retries_next_endpoint: u32,
}

impl LoadBalancedRetryPolicy {
    /// Creates a new `LoadBalancedRetryPolicy` with the given retry budgets.
    pub const fn new(max_retries_same_endpoint: u32, max_retries_next_endpoint: u32) -> Self {
        Self {
            max_retries_same_endpoint,
            max_retries_next_endpoint,
        }
    }

    /// Creates a `LoadBalancedRetryPolicy` using the retry budgets from the given configuration.
    pub fn from_configuration(config: &ClientConfiguration) -> Self {
        Self::new(config.max_retries_same_endpoint, config.max_retries)
    }
}

impl RetryPolicy for LoadBalancedRetryPolicy {
    fn max_retries_same_endpoint(&self) -> u32 {
        self.max_retries_same_endpoint
    }

    fn max_retries_next_endpoint(&self) -> u32 {
        self.max_retries_next_endpoint
    }

    fn is_retriable(&self, failure: &FailureKind, _same_endpoint: bool) -> bool {
        failure.is_connection_level()
    }

    fn is_circuit_tripping(&self, failure: &FailureKind) -> bool {
        failure.is_connection_level()
    }
}
