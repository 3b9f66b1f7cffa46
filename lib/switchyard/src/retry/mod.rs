//! Retry policies.
//!
//! A retry policy decides, after each failed attempt, whether to try the same endpoint again, move on to another
//! endpoint chosen by the load balancer, or give up. Failures are described by [`FailureKind`] so that policies can be
//! written without knowing which transport produced them.

use std::{fmt, sync::Arc};

use http::StatusCode;

use crate::{client::Protocol, config::ClientConfiguration};

mod http_aware;
pub use self::http_aware::HttpRetryPolicy;

mod load_balanced;
pub use self::load_balanced::LoadBalancedRetryPolicy;

/// The class of a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The connection could not be established.
    Connect,

    /// Establishing the connection took longer than the connect timeout.
    ConnectTimeout,

    /// No response arrived within the read timeout.
    ReadTimeout,

    /// The connection was closed before a complete response was received.
    ConnectionClosed,

    /// The server answered with an error status.
    Status(StatusCode),

    /// The response could not be decoded by the pipeline.
    Codec,
}

impl FailureKind {
    /// Returns `true` if the failure happened at the connection level, before any response was received.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::Connect | Self::ConnectTimeout | Self::ReadTimeout | Self::ConnectionClosed
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("connect failed"),
            Self::ConnectTimeout => f.write_str("connect timed out"),
            Self::ReadTimeout => f.write_str("read timed out"),
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::Status(status) => write!(f, "error status {}", status),
            Self::Codec => f.write_str("response decoding failed"),
        }
    }
}

/// A failed attempt, with a human-readable description of what went wrong.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    kind: FailureKind,
    detail: String,
}

impl Failure {
    /// Creates a new `Failure`.
    pub fn new<D: fmt::Display>(kind: FailureKind, detail: D) -> Self {
        Self {
            kind,
            detail: detail.to_string(),
        }
    }

    /// Returns the failure class.
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Returns the failure description.
    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for Failure {}

/// State of an operation after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttemptContext {
    /// What went wrong on the latest attempt.
    pub failure: FailureKind,

    /// Retries already made against the current endpoint.
    pub same_endpoint_retries: u32,

    /// Times the operation has already moved on to a different endpoint.
    pub next_endpoint_retries: u32,
}

/// What to do after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again against the same endpoint.
    RetrySameEndpoint,

    /// Try again against another endpoint chosen by the load balancer.
    RetryNextEndpoint,

    /// Give up and surface the failure.
    Abort,
}

/// Decides whether failed attempts are retried.
///
/// One policy is bound to each client for the client's lifetime, and is shared across all of its requests.
pub trait RetryPolicy: fmt::Debug + Send + Sync {
    /// Maximum retries against the same endpoint.
    fn max_retries_same_endpoint(&self) -> u32;

    /// Maximum number of times to move on to a different endpoint.
    fn max_retries_next_endpoint(&self) -> u32;

    /// Returns `true` if the failure may be retried, either against the same endpoint or a different one.
    fn is_retriable(&self, failure: &FailureKind, same_endpoint: bool) -> bool;

    /// Returns `true` if the failure suggests the endpoint is unhealthy and should be reported to the load balancer.
    fn is_circuit_tripping(&self, _failure: &FailureKind) -> bool {
        false
    }

    /// Decides what to do after a failed attempt.
    ///
    /// Same-endpoint retries are used up first, then the operation moves on to other endpoints, then it aborts.
    fn should_retry(&self, context: &AttemptContext) -> RetryDecision {
        if context.same_endpoint_retries < self.max_retries_same_endpoint() && self.is_retriable(&context.failure, true)
        {
            RetryDecision::RetrySameEndpoint
        } else if context.next_endpoint_retries < self.max_retries_next_endpoint()
            && self.is_retriable(&context.failure, false)
        {
            RetryDecision::RetryNextEndpoint
        } else {
            RetryDecision::Abort
        }
    }
}

/// Returns the explicit retry policy if given, otherwise the default policy for `protocol`.
///
/// HTTP and SSE clients default to [`HttpRetryPolicy`]; TCP and UDP clients default to [`LoadBalancedRetryPolicy`].
/// Both are built from `config`.
pub fn resolve(
    config: &ClientConfiguration, protocol: Protocol, explicit: Option<Arc<dyn RetryPolicy>>,
) -> Arc<dyn RetryPolicy> {
    match explicit {
        Some(policy) => policy,
        None => match protocol {
            Protocol::Http | Protocol::Sse => Arc::new(HttpRetryPolicy::from_configuration(config)),
            Protocol::Tcp | Protocol::Udp => Arc::new(LoadBalancedRetryPolicy::from_configuration(config)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(failure: FailureKind, same: u32, next: u32) -> AttemptContext {
        AttemptContext {
            failure,
            same_endpoint_retries: same,
            next_endpoint_retries: next,
        }
    }

    #[test]
    fn explicit_policy_is_returned_unchanged() {
        let explicit: Arc<dyn RetryPolicy> = Arc::new(LoadBalancedRetryPolicy::new(7, 7));

        for protocol in [Protocol::Tcp, Protocol::Udp, Protocol::Http, Protocol::Sse] {
            let resolved = resolve(&ClientConfiguration::default(), protocol, Some(Arc::clone(&explicit)));
            assert!(Arc::ptr_eq(&explicit, &resolved));
        }
    }

    #[test]
    fn default_policy_follows_protocol() {
        let config = ClientConfiguration {
            max_retries: 3,
            ..Default::default()
        };
        let server_error = FailureKind::Status(StatusCode::BAD_GATEWAY);

        for protocol in [Protocol::Http, Protocol::Sse] {
            let policy = resolve(&config, protocol, None);
            assert!(policy.is_retriable(&server_error, false));
            assert_eq!(policy.max_retries_next_endpoint(), 3);
        }

        for protocol in [Protocol::Tcp, Protocol::Udp] {
            let policy = resolve(&config, protocol, None);
            assert!(!policy.is_retriable(&server_error, false));
            assert_eq!(policy.max_retries_next_endpoint(), 3);
        }
    }

    #[test]
    fn same_endpoint_budget_is_spent_first() {
        let policy = LoadBalancedRetryPolicy::new(2, 1);

        assert_eq!(
            policy.should_retry(&context(FailureKind::Connect, 0, 0)),
            RetryDecision::RetrySameEndpoint
        );
        assert_eq!(
            policy.should_retry(&context(FailureKind::Connect, 1, 0)),
            RetryDecision::RetrySameEndpoint
        );
        assert_eq!(
            policy.should_retry(&context(FailureKind::Connect, 2, 0)),
            RetryDecision::RetryNextEndpoint
        );
        assert_eq!(
            policy.should_retry(&context(FailureKind::Connect, 0, 1)),
            RetryDecision::RetrySameEndpoint
        );
        assert_eq!(
            policy.should_retry(&context(FailureKind::Connect, 2, 1)),
            RetryDecision::Abort
        );
    }
}
