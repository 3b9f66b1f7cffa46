use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use snafu::ResultExt as _;
use tokio::{
    net::{lookup_host, UdpSocket},
    time::timeout,
};

use super::{execute::Executor, ClientParts, Protocol};
use crate::{
    config::ClientConfiguration,
    endpoint::{Endpoint, LoadBalancer},
    error::{Encode, RequestError},
    pipeline::Pipeline,
    retry::{Failure, FailureKind, RetryPolicy},
};

const MAX_DATAGRAM_SIZE: usize = 65_535;

/// A single-datagram request/response client.
///
/// Each attempt sends the encoded request as one datagram from a fresh socket and waits for one datagram back. Nothing
/// is pooled, so UDP clients never register work with the maintenance scheduler.
pub struct UdpClient<I, O> {
    configuration: ClientConfiguration,
    executor: Executor,
    pipeline: Pipeline<I, O>,
}

impl<I: 'static, O: 'static> UdpClient<I, O> {
    pub(crate) fn new(parts: ClientParts<I, O>) -> Self {
        Self {
            executor: Executor::new(
                Protocol::Udp,
                parts.configuration.client_name.clone(),
                parts.load_balancer,
                parts.retry_policy,
            ),
            configuration: parts.configuration,
            pipeline: parts.pipeline,
        }
    }

    /// Sends a request datagram and waits for the response datagram.
    ///
    /// # Errors
    ///
    /// If the request cannot be encoded, or every permitted attempt fails, an error will be returned.
    pub async fn execute(&self, request: I) -> Result<O, RequestError> {
        let payload = self.pipeline.encode(request).context(Encode)?;
        let (_, response) = self
            .executor
            .run(|endpoint| self.attempt(endpoint, payload.clone()))
            .await?;
        Ok(response)
    }

    async fn attempt(&self, endpoint: Endpoint, payload: Bytes) -> Result<O, Failure> {
        let socket = connect(&endpoint).await?;
        socket
            .send(&payload)
            .await
            .map_err(|e| Failure::new(FailureKind::Connect, e))?;

        let mut datagram = vec![0; MAX_DATAGRAM_SIZE];
        let read_timeout = self.configuration.read_timeout();
        let n = match timeout(read_timeout, socket.recv(&mut datagram)).await {
            Ok(Ok(n)) => n,
            // A refused datagram comes back as an error on the next receive.
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(Failure::new(FailureKind::Connect, e))
            }
            Ok(Err(e)) => return Err(Failure::new(FailureKind::ConnectionClosed, e)),
            Err(_) => {
                return Err(Failure::new(
                    FailureKind::ReadTimeout,
                    format!("no datagram after {}ms", read_timeout.as_millis()),
                ))
            }
        };

        let mut buf = BytesMut::from(&datagram[..n]);
        match self.pipeline.decode(&mut buf, true) {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(Failure::new(FailureKind::Codec, "datagram did not hold a complete response")),
            Err(e) => Err(Failure::new(FailureKind::Codec, e)),
        }
    }

    /// Returns the client configuration.
    pub fn configuration(&self) -> &ClientConfiguration {
        &self.configuration
    }

    /// Returns the load balancer.
    pub fn load_balancer(&self) -> &Arc<dyn LoadBalancer> {
        self.executor.load_balancer()
    }

    /// Returns the retry policy.
    pub fn retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        self.executor.retry_policy()
    }

    /// Returns the pipeline.
    pub fn pipeline(&self) -> &Pipeline<I, O> {
        &self.pipeline
    }
}

async fn connect(endpoint: &Endpoint) -> Result<UdpSocket, Failure> {
    let peer = lookup_host((endpoint.host(), endpoint.port()))
        .await
        .map_err(|e| Failure::new(FailureKind::Connect, e))?
        .next()
        .ok_or_else(|| Failure::new(FailureKind::Connect, "endpoint did not resolve to any address"))?;

    let local = match peer {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };

    let socket = UdpSocket::bind(local)
        .await
        .map_err(|e| Failure::new(FailureKind::Connect, e))?;
    socket
        .connect(peer)
        .await
        .map_err(|e| Failure::new(FailureKind::Connect, e))?;

    Ok(socket)
}
