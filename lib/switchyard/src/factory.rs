//! Client construction.

use std::{fmt, marker::PhantomData, sync::Arc};

use bytes::Bytes;
use snafu::ResultExt as _;
use tracing::debug;

use crate::{
    client::{ClientParts, Construct, Http, Sse, Tcp, Transport, Udp},
    config::ClientConfiguration,
    endpoint::{self, LoadBalancer},
    error::{ClientError, Configuration, Scheduler},
    maintenance::SharedScheduler,
    pipeline::{self, Pipeline, PipelineChoice, PipelineStrategy, ServerSentEvent},
    retry::{self, RetryPolicy},
};

/// Entry point for building clients.
///
/// Every client built through a factory shares the factory's maintenance scheduler. Factories are cheap to clone, and
/// clones share the same scheduler.
///
/// Each `new_*_client` method returns a builder. Anything not set on the builder is resolved when the client is built:
///
/// - the configuration defaults to [`ClientConfiguration::default`]
/// - the load balancer is derived from the configured endpoints
/// - the retry policy is the protocol's default, built from the configuration
/// - the pipeline is the protocol's default
#[derive(Clone, Debug)]
pub struct ClientFactory {
    scheduler: SharedScheduler,
}

impl ClientFactory {
    /// Creates a new `ClientFactory` using the given shared scheduler.
    pub fn new(scheduler: SharedScheduler) -> Self {
        Self { scheduler }
    }

    /// Returns the shared scheduler used by clients built through this factory.
    pub fn scheduler(&self) -> &SharedScheduler {
        &self.scheduler
    }

    /// Starts building a TCP client.
    pub fn new_tcp_client(&self) -> ClientBuilder<'_, Tcp, Bytes, Bytes> {
        ClientBuilder::new(self)
    }

    /// Starts building a UDP client.
    ///
    /// UDP clients do not pool connections, and never use the shared scheduler.
    pub fn new_udp_client(&self) -> ClientBuilder<'_, Udp, Bytes, Bytes> {
        ClientBuilder::new(self)
    }

    /// Starts building an HTTP client.
    pub fn new_http_client(&self) -> ClientBuilder<'_, Http, Bytes, Bytes> {
        ClientBuilder::new(self)
    }

    /// Starts building a server-sent events client.
    pub fn new_sse_client(&self) -> ClientBuilder<'_, Sse, Bytes, ServerSentEvent> {
        ClientBuilder::new(self)
    }
}

/// Builder for a client of protocol `P`, sending `I` and receiving `O`.
pub struct ClientBuilder<'a, P, I, O> {
    factory: &'a ClientFactory,
    load_balancer: Option<Arc<dyn LoadBalancer>>,
    configuration: Option<ClientConfiguration>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    pipeline: PipelineChoice<I, O>,
    _protocol: PhantomData<fn() -> P>,
}

impl<'a, P: Transport> ClientBuilder<'a, P, P::DefaultRequest, P::DefaultResponse> {
    fn new(factory: &'a ClientFactory) -> Self {
        Self {
            factory,
            load_balancer: None,
            configuration: None,
            retry_policy: None,
            pipeline: PipelineChoice::ProtocolDefault(P::default_pipeline),
            _protocol: PhantomData,
        }
    }
}

impl<'a, P: Transport, I, O> ClientBuilder<'a, P, I, O> {
    /// Sets the load balancer.
    ///
    /// When not set, a load balancer is derived from the configured endpoints.
    pub fn with_load_balancer(mut self, load_balancer: Arc<dyn LoadBalancer>) -> Self {
        self.load_balancer = Some(load_balancer);
        self
    }

    /// Sets the client configuration.
    ///
    /// When not set, [`ClientConfiguration::default`] is used.
    pub fn with_configuration(mut self, configuration: ClientConfiguration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// Sets the retry policy.
    ///
    /// The client uses exactly this policy instance.
    pub fn with_retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    /// Sets the pipeline.
    ///
    /// The pipeline must declare support for this builder's protocol, or building will fail.
    pub fn with_pipeline<S>(self, pipeline: Arc<S>) -> ClientBuilder<'a, P, S::Request, S::Response>
    where
        S: PipelineStrategy + 'static,
    {
        let pipeline: Pipeline<S::Request, S::Response> = pipeline;
        self.with_shared_pipeline(pipeline)
    }

    /// Sets an already type-erased pipeline.
    ///
    /// The client uses exactly this pipeline instance.
    pub fn with_shared_pipeline<I2, O2>(self, pipeline: Pipeline<I2, O2>) -> ClientBuilder<'a, P, I2, O2> {
        ClientBuilder {
            factory: self.factory,
            load_balancer: self.load_balancer,
            configuration: self.configuration,
            retry_policy: self.retry_policy,
            pipeline: PipelineChoice::Explicit(pipeline),
            _protocol: PhantomData,
        }
    }
}

impl<P: Construct<I, O>, I, O> ClientBuilder<'_, P, I, O> {
    /// Builds the client.
    ///
    /// Resolution happens in a fixed order: configuration, then retry policy, pipeline and load balancer, then the
    /// shared scheduler (for protocols that pool connections), and finally the client itself. Acquiring the scheduler
    /// is the last step that can fail, so a failed build never starts it. No network I/O happens here.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, the pipeline does not support this protocol, or the shared scheduler cannot be
    /// started, an error will be returned and no client is created.
    pub fn build(self) -> Result<P::Client, ClientError> {
        let protocol = P::PROTOCOL;

        let configuration = self.configuration.unwrap_or_default();
        configuration.validate().context(Configuration { protocol })?;

        let retry_policy = retry::resolve(&configuration, protocol, self.retry_policy);
        let pipeline = pipeline::resolve(protocol, self.pipeline)?;
        let explicit_load_balancer = self.load_balancer.is_some();
        let load_balancer = endpoint::resolve(&configuration, self.load_balancer).context(Configuration { protocol })?;

        let scheduler = if protocol.uses_pool_maintenance() {
            Some(self.factory.scheduler.acquire().context(Scheduler)?)
        } else {
            None
        };

        debug!(
            client = %configuration.client_name,
            %protocol,
            pipeline = pipeline.name(),
            explicit_load_balancer,
            "Building client."
        );

        Ok(P::construct(ClientParts {
            load_balancer,
            configuration,
            retry_policy,
            pipeline,
            scheduler,
        }))
    }
}

impl<P: Transport, I, O> fmt::Debug for ClientBuilder<'_, P, I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("protocol", &P::PROTOCOL)
            .field("configuration", &self.configuration)
            .field("retry_policy", &self.retry_policy)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        endpoint::StaticLoadBalancer,
        pipeline::{BytesPipeline, ServerSentEventPipeline},
        retry::{HttpRetryPolicy, LoadBalancedRetryPolicy},
    };

    fn configuration() -> ClientConfiguration {
        ClientConfiguration {
            client_name: "factory-test".to_string(),
            endpoints: vec!["127.0.0.1:9".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn builds_without_configuration() {
        let factory = ClientFactory::new(SharedScheduler::new(1));

        let http = factory.new_http_client().build().unwrap();
        let sse = factory.new_sse_client().build().unwrap();
        let tcp = factory.new_tcp_client().build().unwrap();
        let udp = factory.new_udp_client().build().unwrap();

        assert_eq!(http.configuration(), &ClientConfiguration::default());
        assert_eq!(sse.configuration(), &ClientConfiguration::default());
        assert!(tcp.load_balancer().choose(&[]).is_none());
        assert!(udp.load_balancer().choose(&[]).is_none());
    }

    #[test]
    fn malformed_endpoint_fails_before_scheduler_is_started() {
        let factory = ClientFactory::new(SharedScheduler::new(1));
        let result = factory
            .new_tcp_client()
            .with_configuration(ClientConfiguration {
                endpoints: vec!["no-port".to_string()],
                ..configuration()
            })
            .build();

        match result {
            Err(ClientError::Configuration { protocol, .. }) => assert_eq!(protocol, crate::Protocol::Tcp),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("client built with a malformed endpoint"),
        }
        assert!(factory.scheduler().get().is_none());
    }

    #[test]
    fn explicit_load_balancer_needs_no_endpoints() {
        let factory = ClientFactory::new(SharedScheduler::new(1));
        let load_balancer: Arc<dyn LoadBalancer> =
            Arc::new(StaticLoadBalancer::new(vec!["127.0.0.1:9".parse().unwrap()]));

        let client = factory
            .new_http_client()
            .with_load_balancer(Arc::clone(&load_balancer))
            .build()
            .unwrap();
        assert!(Arc::ptr_eq(client.load_balancer(), &load_balancer));
        assert_eq!(client.configuration(), &ClientConfiguration::default());
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let factory = ClientFactory::new(SharedScheduler::new(1));
        let result = factory
            .new_tcp_client()
            .with_configuration(ClientConfiguration {
                max_connections_per_endpoint: 0,
                ..configuration()
            })
            .build();

        assert!(matches!(result, Err(ClientError::Configuration { .. })));
        assert!(factory.scheduler().get().is_none());
    }

    #[test]
    fn explicit_dependencies_are_used_as_is() {
        let factory = ClientFactory::new(SharedScheduler::new(1));
        let retry_policy: Arc<dyn RetryPolicy> = Arc::new(LoadBalancedRetryPolicy::new(4, 4));
        let pipeline: Pipeline<Bytes, Bytes> = Arc::new(BytesPipeline);

        let client = factory
            .new_http_client()
            .with_configuration(configuration())
            .with_retry_policy(Arc::clone(&retry_policy))
            .with_shared_pipeline(Arc::clone(&pipeline))
            .build()
            .unwrap();

        assert!(Arc::ptr_eq(client.retry_policy(), &retry_policy));
        assert!(std::ptr::addr_eq(Arc::as_ptr(client.pipeline()), Arc::as_ptr(&pipeline)));
    }

    #[test]
    fn defaults_follow_protocol() {
        let factory = ClientFactory::new(SharedScheduler::new(1));
        let http = factory.new_http_client().with_configuration(configuration()).build().unwrap();
        let sse = factory.new_sse_client().with_configuration(configuration()).build().unwrap();
        let tcp = factory.new_tcp_client().with_configuration(configuration()).build().unwrap();

        assert_eq!(http.pipeline().name(), "bytes");
        assert_eq!(sse.pipeline().name(), "server-sent-events");
        assert_eq!(tcp.pipeline().name(), "bytes");

        let expected_http = format!("{:?}", HttpRetryPolicy::from_configuration(&configuration()));
        assert_eq!(format!("{:?}", http.retry_policy()), expected_http);
        assert_eq!(format!("{:?}", sse.retry_policy()), expected_http);
        assert_eq!(
            format!("{:?}", tcp.retry_policy()),
            format!("{:?}", LoadBalancedRetryPolicy::from_configuration(&configuration()))
        );
    }

    #[test]
    fn incompatible_pipeline_fails_before_scheduler_is_started() {
        let factory = ClientFactory::new(SharedScheduler::new(1));
        let result = factory
            .new_tcp_client()
            .with_configuration(configuration())
            .with_pipeline(Arc::new(ServerSentEventPipeline::new()))
            .build();

        assert!(matches!(result, Err(ClientError::IncompatiblePipeline { .. })));
        assert!(factory.scheduler().get().is_none());
    }

    #[test]
    fn scheduler_is_shared_except_by_udp() {
        let factory = ClientFactory::new(SharedScheduler::new(1));

        let udp = factory.new_udp_client().with_configuration(configuration()).build().unwrap();
        assert!(factory.scheduler().get().is_none());
        assert_eq!(udp.pipeline().name(), "bytes");

        let tcp = factory.new_tcp_client().with_configuration(configuration()).build().unwrap();
        let http = factory.new_http_client().with_configuration(configuration()).build().unwrap();
        let sse = factory.new_sse_client().with_configuration(configuration()).build().unwrap();

        let scheduler = factory.scheduler().get().unwrap();
        assert_eq!(scheduler.scheduled_tasks(), 3);
        assert!(tcp.cleanup_task().is_some());
        assert!(http.cleanup_task().is_some());
        assert!(sse.cleanup_task().is_some());

        drop(tcp);
        assert_eq!(scheduler.scheduled_tasks(), 2);
    }
}
