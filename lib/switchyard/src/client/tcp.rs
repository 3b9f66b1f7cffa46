use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use snafu::ResultExt as _;
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
    time::timeout,
};
use tracing::debug;

use super::{execute::Executor, ClientParts, Protocol};
use crate::{
    config::ClientConfiguration,
    endpoint::{Endpoint, LoadBalancer},
    error::{Encode, RequestError},
    pipeline::{Pipeline, PipelineStrategy},
    pool::{CleanupRegistration, ConnectionPool},
    retry::{Failure, FailureKind, RetryPolicy},
};

const READ_BUFFER_CAPACITY: usize = 8192;

/// Opens a TCP connection to `endpoint`, giving up after `connect_timeout`.
pub(super) async fn connect(endpoint: &Endpoint, connect_timeout: Duration) -> Result<TcpStream, Failure> {
    match timeout(connect_timeout, TcpStream::connect((endpoint.host(), endpoint.port()))).await {
        Ok(Ok(stream)) => {
            // Requests are written in one go, so there is nothing to gain from coalescing.
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%endpoint, error = %e, "Failed to disable Nagle's algorithm on connection.");
            }
            Ok(stream)
        }
        Ok(Err(e)) => Err(Failure::new(FailureKind::Connect, e)),
        Err(_) => Err(Failure::new(
            FailureKind::ConnectTimeout,
            format!("no connection after {}ms", connect_timeout.as_millis()),
        )),
    }
}

/// A request/response client over pooled TCP connections.
///
/// Each request is encoded by the pipeline and written to a connection, and the response is decoded from the bytes
/// read back. Connections are returned to the pool when the response ends cleanly, with no unread bytes left over.
pub struct TcpClient<I, O> {
    configuration: ClientConfiguration,
    executor: Executor,
    pipeline: Pipeline<I, O>,
    pool: Arc<ConnectionPool<TcpStream>>,
    cleanup: Option<CleanupRegistration>,
}

impl<I: 'static, O: 'static> TcpClient<I, O> {
    pub(crate) fn new(parts: ClientParts<I, O>) -> Self {
        let ClientParts {
            load_balancer,
            configuration,
            retry_policy,
            pipeline,
            scheduler,
        } = parts;

        let pool = Arc::new(ConnectionPool::from_configuration(&configuration));
        let cleanup =
            scheduler.map(|scheduler| pool.register_cleanup(&scheduler, configuration.pool_cleaner_interval()));

        Self {
            executor: Executor::new(
                Protocol::Tcp,
                configuration.client_name.clone(),
                load_balancer,
                retry_policy,
            ),
            configuration,
            pipeline,
            pool,
            cleanup,
        }
    }

    /// Sends a request and waits for its response.
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
        let mut stream = match self.pool.checkout(&endpoint) {
            Some(stream) => stream,
            None => connect(&endpoint, self.configuration.connect_timeout()).await?,
        };

        stream
            .write_all(&payload)
            .await
            .map_err(|e| Failure::new(FailureKind::ConnectionClosed, e))?;

        let (response, reusable) =
            read_response(&mut stream, self.pipeline.as_ref(), self.configuration.read_timeout()).await?;
        if reusable {
            self.pool.checkin(endpoint, stream);
        }

        Ok(response)
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

    /// Returns the idle connection pool cleanup task, if one is registered.
    pub fn cleanup_task(&self) -> Option<&CleanupRegistration> {
        self.cleanup.as_ref()
    }

    /// Returns the number of idle pooled connections.
    pub fn idle_connections(&self) -> usize {
        self.pool.idle_count()
    }
}

/// Reads from `stream` until the pipeline decodes a response.
///
/// Also returns whether the connection can be reused, which is only the case if the stream is still open and every
/// byte read was consumed by the response.
async fn read_response<I, O>(
    stream: &mut TcpStream, pipeline: &dyn PipelineStrategy<Request = I, Response = O>, read_timeout: Duration,
) -> Result<(O, bool), Failure> {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

    loop {
        let n = match timeout(read_timeout, stream.read_buf(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(Failure::new(FailureKind::ConnectionClosed, e)),
            Err(_) => {
                return Err(Failure::new(
                    FailureKind::ReadTimeout,
                    format!("no response after {}ms", read_timeout.as_millis()),
                ))
            }
        };

        let is_eof = n == 0;
        match pipeline.decode(&mut buf, is_eof) {
            Ok(Some(response)) => return Ok((response, !is_eof && buf.is_empty())),
            Ok(None) if is_eof => {
                return Err(Failure::new(
                    FailureKind::ConnectionClosed,
                    "connection closed before a complete response was received",
                ))
            }
            Ok(None) => {}
            Err(e) => return Err(Failure::new(FailureKind::Codec, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn connect_disables_nagle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());

        let stream = connect(&endpoint, Duration::from_secs(1)).await.unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn connect_reports_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::new("127.0.0.1", listener.local_addr().unwrap().port());
        drop(listener);

        let failure = connect(&endpoint, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(failure.kind(), FailureKind::Connect);
    }
}
