//! Protocol clients.
//!
//! Each protocol has a marker type ([`Tcp`], [`Udp`], [`Http`], [`Sse`]) naming its default pipeline and the client it
//! constructs. The factory resolves every dependency of a client into [`ClientParts`] and hands them to the protocol's
//! [`Construct`] implementation.

use std::{fmt, sync::Arc};

use bytes::Bytes;

use crate::{
    config::ClientConfiguration,
    endpoint::LoadBalancer,
    maintenance::PoolMaintenanceScheduler,
    pipeline::{self, Pipeline, ServerSentEvent},
    retry::RetryPolicy,
};

mod execute;

mod http;
pub use self::http::HttpClient;

mod sse;
pub use self::sse::{EventStream, SseClient};

mod tcp;
pub use self::tcp::TcpClient;

mod udp;
pub use self::udp::UdpClient;

/// A client protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Raw TCP request/response.
    Tcp,

    /// Single-datagram UDP request/response.
    Udp,

    /// HTTP/1.1.
    Http,

    /// Server-sent events over HTTP/1.1.
    Sse,
}

impl Protocol {
    /// Returns `true` if clients of this protocol keep pooled connections that need periodic cleanup.
    ///
    /// UDP is connectionless, so UDP clients have nothing to clean up and never use the maintenance scheduler.
    pub const fn uses_pool_maintenance(&self) -> bool {
        !matches!(self, Self::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Http => "HTTP",
            Self::Sse => "SSE",
        })
    }
}

/// Fully resolved dependencies of a client.
pub struct ClientParts<I, O> {
    /// Load balancer, either supplied by the caller or derived from `configuration`.
    pub load_balancer: Arc<dyn LoadBalancer>,

    /// Validated client configuration.
    pub configuration: ClientConfiguration,

    /// Retry policy.
    pub retry_policy: Arc<dyn RetryPolicy>,

    /// Pipeline.
    pub pipeline: Pipeline<I, O>,

    /// Shared maintenance scheduler, for protocols that pool connections.
    pub scheduler: Option<PoolMaintenanceScheduler>,
}

/// A client protocol and its defaults.
pub trait Transport: Send + Sync + 'static {
    /// The protocol.
    const PROTOCOL: Protocol;

    /// Request type of the default pipeline.
    type DefaultRequest;

    /// Response type of the default pipeline.
    type DefaultResponse;

    /// Returns the default pipeline for this protocol.
    fn default_pipeline() -> Pipeline<Self::DefaultRequest, Self::DefaultResponse>;
}

/// Builds a client of this protocol for requests of type `I` and responses of type `O`.
pub trait Construct<I, O>: Transport {
    /// The client type.
    type Client;

    /// Creates the client from its resolved parts.
    ///
    /// Construction cannot fail, and no network I/O happens during it.
    fn construct(parts: ClientParts<I, O>) -> Self::Client;
}

/// TCP protocol marker.
#[derive(Debug)]
pub enum Tcp {}

/// UDP protocol marker.
#[derive(Debug)]
pub enum Udp {}

/// HTTP protocol marker.
#[derive(Debug)]
pub enum Http {}

/// SSE protocol marker.
#[derive(Debug)]
pub enum Sse {}

impl Transport for Tcp {
    const PROTOCOL: Protocol = Protocol::Tcp;
    type DefaultRequest = Bytes;
    type DefaultResponse = Bytes;

    fn default_pipeline() -> Pipeline<Bytes, Bytes> {
        pipeline::bytes_pipeline()
    }
}

impl Transport for Udp {
    const PROTOCOL: Protocol = Protocol::Udp;
    type DefaultRequest = Bytes;
    type DefaultResponse = Bytes;

    fn default_pipeline() -> Pipeline<Bytes, Bytes> {
        pipeline::bytes_pipeline()
    }
}

impl Transport for Http {
    const PROTOCOL: Protocol = Protocol::Http;
    type DefaultRequest = Bytes;
    type DefaultResponse = Bytes;

    fn default_pipeline() -> Pipeline<Bytes, Bytes> {
        pipeline::bytes_pipeline()
    }
}

impl Transport for Sse {
    const PROTOCOL: Protocol = Protocol::Sse;
    type DefaultRequest = Bytes;
    type DefaultResponse = ServerSentEvent;

    fn default_pipeline() -> Pipeline<Bytes, ServerSentEvent> {
        pipeline::sse_pipeline()
    }
}

impl<I: 'static, O: 'static> Construct<I, O> for Tcp {
    type Client = TcpClient<I, O>;

    fn construct(parts: ClientParts<I, O>) -> Self::Client {
        TcpClient::new(parts)
    }
}

impl<I: 'static, O: 'static> Construct<I, O> for Udp {
    type Client = UdpClient<I, O>;

    fn construct(parts: ClientParts<I, O>) -> Self::Client {
        UdpClient::new(parts)
    }
}

impl<I: 'static, O: 'static> Construct<I, O> for Http {
    type Client = HttpClient<I, O>;

    fn construct(parts: ClientParts<I, O>) -> Self::Client {
        HttpClient::new(parts)
    }
}

impl<I: 'static, O: Send + 'static> Construct<I, O> for Sse {
    type Client = SseClient<I, O>;

    fn construct(parts: ClientParts<I, O>) -> Self::Client {
        SseClient::new(parts)
    }
}
