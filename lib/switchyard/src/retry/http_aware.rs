use http::StatusCode;

use crate::config::ClientConfiguration;

use super::{FailureKind, LoadBalancedRetryPolicy, RetryPolicy};

/// The default retry policy for HTTP and SSE clients.
///
/// Extends [`LoadBalancedRetryPolicy`] with HTTP semantics:
///
/// - server errors (5xx) are retried, but only against a different endpoint
/// - client errors (4xx) are never retried, as repeating the same request will not change the outcome
/// - 503 Service Unavailable additionally marks the endpoint as unhealthy
///
/// Connection-level failures follow the generic policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRetryPolicy {
    inner: LoadBalancedRetryPolicy,
}

impl HttpRetryPolicy {
    /// Creates a new `HttpRetryPolicy` with the given retry budgets.
    pub const fn new(max_retries_same_endpoint: u32, max_retries_next_endpoint: u32) -> Self {
        Self {
            inner: LoadBalancedRetryPolicy::new(max_retries_same_endpoint, max_retries_next_endpoint),
        }
    }

    /// Creates an `HttpRetryPolicy` using the retry budgets from the given configuration.
    pub fn from_configuration(config: &ClientConfiguration) -> Self {
        Self {
            inner: LoadBalancedRetryPolicy::from_configuration(config),
        }
    }
}

impl RetryPolicy for HttpRetryPolicy {
    fn max_retries_same_endpoint(&self) -> u32 {
        self.inner.max_retries_same_endpoint()
    }

    fn max_retries_next_endpoint(&self) -> u32 {
        self.inner.max_retries_next_endpoint()
    }

    fn is_retriable(&self, failure: &FailureKind, same_endpoint: bool) -> bool {
        match failure {
            FailureKind::Status(status) if status.is_server_error() => !same_endpoint,
            FailureKind::Status(_) => false,
            other => self.inner.is_retriable(other, same_endpoint),
        }
    }

    fn is_circuit_tripping(&self, failure: &FailureKind) -> bool {
        match failure {
            FailureKind::Status(status) => *status == StatusCode::SERVICE_UNAVAILABLE,
            other => self.inner.is_circuit_tripping(other),
        }
    }
}
