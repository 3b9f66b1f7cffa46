use snafu::Snafu;
use switchyard_config::{ConfigurationError, GenericError};

use crate::{client::Protocol, endpoint::Endpoint, maintenance::SchedulerError, retry::Failure};

/// A client construction error.
///
/// Construction either succeeds with a fully resolved client or fails with one of these errors. No partially
/// initialized client is ever returned.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ClientError {
    /// The client configuration was missing a required value or contained an invalid one.
    #[snafu(display("Invalid configuration for {} client.", protocol))]
    Configuration {
        /// Protocol of the client being constructed.
        protocol: Protocol,

        /// Error source.
        source: ConfigurationError,
    },

    /// The supplied pipeline was not built for the requested protocol.
    #[snafu(display(
        "Pipeline '{}' cannot be used by {} clients (built for: {}).",
        pipeline,
        protocol,
        supported
    ))]
    IncompatiblePipeline {
        /// Name of the rejected pipeline.
        pipeline: &'static str,

        /// Protocol of the client being constructed.
        protocol: Protocol,

        /// Protocols the pipeline declares support for.
        supported: String,
    },

    /// The shared pool maintenance scheduler could not be started.
    #[snafu(display("Failed to acquire pool maintenance scheduler."))]
    Scheduler {
        /// Error source.
        source: SchedulerError,
    },
}

/// A request execution error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum RequestError {
    /// The load balancer had no endpoint to offer.
    #[snafu(display("No endpoint available."))]
    NoEndpointAvailable,

    /// The request could not be encoded by the pipeline.
    #[snafu(display("Failed to encode request."))]
    Encode {
        /// Error source.
        source: GenericError,
    },

    /// Every permitted attempt failed, or the retry policy aborted.
    #[snafu(display("Request to {} failed after {} attempt(s): {}", endpoint, attempts, failure))]
    Failed {
        /// Endpoint of the last attempt.
        endpoint: Endpoint,

        /// Number of attempts made.
        attempts: u32,

        /// Failure of the last attempt.
        failure: Failure,
    },

    /// An established response stream broke off.
    #[snafu(display("Response stream from {} failed: {}", endpoint, failure))]
    Stream {
        /// Endpoint serving the stream.
        endpoint: Endpoint,

        /// What went wrong.
        failure: Failure,
    },
}

impl RequestError {
    /// Returns the failure of the last attempt, if any attempt was made.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed { failure, .. } | Self::Stream { failure, .. } => Some(failure),
            _ => None,
        }
    }

    /// Returns the number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Failed { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}
