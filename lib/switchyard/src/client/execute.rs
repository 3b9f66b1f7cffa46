use std::{future::Future, sync::Arc};

use snafu::OptionExt as _;
use tracing::debug;

use super::Protocol;
use crate::{
    endpoint::{Endpoint, LoadBalancer},
    error::{Failed, NoEndpointAvailable, RequestError},
    retry::{AttemptContext, Failure, RetryDecision, RetryPolicy},
};

/// Drives the attempts of a single operation through the load balancer and retry policy.
pub(super) struct Executor {
    protocol: Protocol,
    client_name: String,
    load_balancer: Arc<dyn LoadBalancer>,
    retry_policy: Arc<dyn RetryPolicy>,
}

impl Executor {
    pub(super) fn new(
        protocol: Protocol, client_name: String, load_balancer: Arc<dyn LoadBalancer>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            protocol,
            client_name,
            load_balancer,
            retry_policy,
        }
    }

    pub(super) fn load_balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.load_balancer
    }

    pub(super) fn retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.retry_policy
    }

    /// Runs `attempt` until it succeeds or the retry policy gives up.
    ///
    /// Each call to `attempt` receives the endpoint to use. On success, the endpoint and the attempt's output are
    /// returned.
    pub(super) async fn run<T, F, Fut>(&self, mut attempt: F) -> Result<(Endpoint, T), RequestError>
    where
        F: FnMut(Endpoint) -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let mut tried = Vec::new();
        let mut endpoint = self.load_balancer.choose(&tried).context(NoEndpointAvailable)?;
        let mut same_endpoint_retries = 0;
        let mut next_endpoint_retries = 0;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let failure = match attempt(endpoint.clone()).await {
                Ok(output) => {
                    self.load_balancer.record_success(&endpoint);
                    return Ok((endpoint, output));
                }
                Err(failure) => failure,
            };

            if self.retry_policy.is_circuit_tripping(&failure.kind()) {
                self.load_balancer.record_failure(&endpoint);
            }

            let decision = self.retry_policy.should_retry(&AttemptContext {
                failure: failure.kind(),
                same_endpoint_retries,
                next_endpoint_retries,
            });

            debug!(
                client = %self.client_name,
                protocol = %self.protocol,
                %endpoint,
                attempt = attempts,
                error = %failure,
                ?decision,
                "Request attempt failed."
            );

            match decision {
                RetryDecision::RetrySameEndpoint => same_endpoint_retries += 1,
                RetryDecision::RetryNextEndpoint => {
                    next_endpoint_retries += 1;
                    same_endpoint_retries = 0;

                    if !tried.contains(&endpoint) {
                        tried.push(endpoint.clone());
                    }
                    match self.load_balancer.choose(&tried) {
                        Some(next) => endpoint = next,
                        None => return Failed { endpoint, attempts, failure }.fail(),
                    }
                }
                RetryDecision::Abort => return Failed { endpoint, attempts, failure }.fail(),
            }
        }
    }
}
