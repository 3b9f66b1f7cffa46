use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{
    header::HOST,
    uri::{PathAndQuery, Uri},
    HeaderMap, HeaderValue, Method, Request, Response, Version,
};
use http_body_util::{BodyExt as _, Full};
use hyper::{
    body::Incoming,
    client::conn::http1::{self, SendRequest},
};
use hyper_util::rt::TokioIo;
use snafu::ResultExt as _;
use tokio::time::timeout;
use tracing::debug;

use super::{execute::Executor, tcp::connect, ClientParts, Protocol};
use crate::{
    config::ClientConfiguration,
    endpoint::{Endpoint, LoadBalancer},
    error::{Encode, RequestError},
    pipeline::Pipeline,
    pool::{CleanupRegistration, ConnectionPool, PooledConnection},
    retry::{Failure, FailureKind, RetryPolicy},
};

/// An HTTP/1.1 connection, driven by a background task for as long as the sender is alive.
pub(super) struct HttpConnection {
    sender: SendRequest<Full<Bytes>>,
}

impl PooledConnection for HttpConnection {
    fn is_reusable(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// The parts of a request needed to send it again.
#[derive(Clone, Debug)]
pub(super) struct RequestTemplate {
    method: Method,
    path_and_query: PathAndQuery,
    version: Version,
    headers: HeaderMap,
}

impl RequestTemplate {
    pub(super) fn from_parts(parts: http::request::Parts) -> Self {
        Self {
            method: parts.method,
            path_and_query: origin_form(&parts.uri),
            version: parts.version,
            headers: parts.headers,
        }
    }

    fn build(&self, endpoint: &Endpoint, body: Bytes) -> Result<Request<Full<Bytes>>, Failure> {
        let mut request = Request::new(Full::new(body));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = Uri::from(self.path_and_query.clone());
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers.clone();

        if !request.headers().contains_key(HOST) {
            let host = HeaderValue::try_from(endpoint.authority()).map_err(|e| Failure::new(FailureKind::Codec, e))?;
            request.headers_mut().insert(HOST, host);
        }

        Ok(request)
    }

    fn describe(&self) -> String {
        format!("{} {}", self.method, self.path_and_query)
    }
}

fn origin_form(uri: &Uri) -> PathAndQuery {
    uri.path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"))
}

/// Connection handling shared by the HTTP and SSE clients.
pub(super) struct HttpTransport<I, O> {
    configuration: ClientConfiguration,
    executor: Executor,
    pipeline: Pipeline<I, O>,
    pool: Arc<ConnectionPool<HttpConnection>>,
    cleanup: Option<CleanupRegistration>,
}

impl<I: 'static, O: 'static> HttpTransport<I, O> {
    pub(super) fn new(protocol: Protocol, parts: ClientParts<I, O>) -> Self {
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
            executor: Executor::new(protocol, configuration.client_name.clone(), load_balancer, retry_policy),
            configuration,
            pipeline,
            pool,
            cleanup,
        }
    }

    pub(super) fn encode(&self, request: Request<I>) -> Result<(RequestTemplate, Bytes), RequestError> {
        let (parts, body) = request.into_parts();
        let payload = self.pipeline.encode(body).context(Encode)?;
        Ok((RequestTemplate::from_parts(parts), payload))
    }

    pub(super) fn executor(&self) -> &Executor {
        &self.executor
    }

    pub(super) fn pipeline(&self) -> &Pipeline<I, O> {
        &self.pipeline
    }

    pub(super) fn pool(&self) -> &Arc<ConnectionPool<HttpConnection>> {
        &self.pool
    }

    pub(super) fn configuration(&self) -> &ClientConfiguration {
        &self.configuration
    }

    pub(super) fn cleanup_task(&self) -> Option<&CleanupRegistration> {
        self.cleanup.as_ref()
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<HttpConnection, Failure> {
        let connect_timeout = self.configuration.connect_timeout();
        let stream = connect(endpoint, connect_timeout).await?;

        let (sender, connection) = match timeout(connect_timeout, http1::handshake(TokioIo::new(stream))).await {
            Ok(Ok(parts)) => parts,
            Ok(Err(e)) => return Err(Failure::new(FailureKind::Connect, e)),
            Err(_) => {
                return Err(Failure::new(
                    FailureKind::ConnectTimeout,
                    format!("no HTTP handshake after {}ms", connect_timeout.as_millis()),
                ))
            }
        };

        let peer = endpoint.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(endpoint = %peer, error = %e, "HTTP connection closed with error.");
            }
        });

        Ok(HttpConnection { sender })
    }

    /// Sends the request and waits for the response head.
    ///
    /// Error statuses are turned into failures. On success, the connection is handed back with the response so that it
    /// can be returned to the pool once the body has been read.
    pub(super) async fn send(
        &self, endpoint: &Endpoint, template: &RequestTemplate, payload: Bytes,
    ) -> Result<(Response<Incoming>, HttpConnection), Failure> {
        let mut connection = match self.pool.checkout(endpoint) {
            Some(connection) => connection,
            None => self.connect(endpoint).await?,
        };

        connection
            .sender
            .ready()
            .await
            .map_err(|e| Failure::new(FailureKind::ConnectionClosed, e))?;

        let mut request = template.build(endpoint, payload)?;
        self.pipeline.prepare_headers(request.headers_mut());

        let read_timeout = self.configuration.read_timeout();
        let response = match timeout(read_timeout, connection.sender.send_request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(Failure::new(FailureKind::ConnectionClosed, e)),
            Err(_) => {
                return Err(Failure::new(
                    FailureKind::ReadTimeout,
                    format!("no response after {}ms", read_timeout.as_millis()),
                ))
            }
        };

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(Failure::new(FailureKind::Status(status), template.describe()));
        }

        Ok((response, connection))
    }
}

/// An HTTP/1.1 client over pooled connections.
///
/// The request body is encoded by the pipeline, and the full response body is decoded once it has been received.
/// Responses with a 4xx or 5xx status are failures, retried or not according to the retry policy.
pub struct HttpClient<I, O> {
    transport: HttpTransport<I, O>,
}

impl<I: 'static, O: 'static> HttpClient<I, O> {
    pub(crate) fn new(parts: ClientParts<I, O>) -> Self {
        Self {
            transport: HttpTransport::new(Protocol::Http, parts),
        }
    }

    /// Sends a request and waits for the decoded response.
    ///
    /// Only the path and query of the request URI are used: the scheme and authority come from the endpoint chosen by
    /// the load balancer. A `Host` header is added if the request has none.
    ///
    /// # Errors
    ///
    /// If the request body cannot be encoded, or every permitted attempt fails, an error will be returned.
    pub async fn execute(&self, request: Request<I>) -> Result<Response<O>, RequestError> {
        let (template, payload) = self.transport.encode(request)?;
        let (_, response) = self
            .transport
            .executor()
            .run(|endpoint| self.attempt(endpoint, &template, payload.clone()))
            .await?;
        Ok(response)
    }

    async fn attempt(
        &self, endpoint: Endpoint, template: &RequestTemplate, payload: Bytes,
    ) -> Result<Response<O>, Failure> {
        let (response, connection) = self.transport.send(&endpoint, template, payload).await?;
        let (parts, body) = response.into_parts();

        let read_timeout = self.transport.configuration().read_timeout();
        let body = match timeout(read_timeout, body.collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) => return Err(Failure::new(FailureKind::ConnectionClosed, e)),
            Err(_) => {
                return Err(Failure::new(
                    FailureKind::ReadTimeout,
                    format!("response body incomplete after {}ms", read_timeout.as_millis()),
                ))
            }
        };

        let mut buf = BytesMut::from(&body[..]);
        let decoded = match self.transport.pipeline().decode(&mut buf, true) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return Err(Failure::new(FailureKind::Codec, "response body did not hold a complete response")),
            Err(e) => return Err(Failure::new(FailureKind::Codec, e)),
        };

        self.transport.pool().checkin(endpoint, connection);
        Ok(Response::from_parts(parts, decoded))
    }

    /// Returns the client configuration.
    pub fn configuration(&self) -> &ClientConfiguration {
        self.transport.configuration()
    }

    /// Returns the load balancer.
    pub fn load_balancer(&self) -> &Arc<dyn LoadBalancer> {
        self.transport.executor().load_balancer()
    }

    /// Returns the retry policy.
    pub fn retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        self.transport.executor().retry_policy()
    }

    /// Returns the pipeline.
    pub fn pipeline(&self) -> &Pipeline<I, O> {
        self.transport.pipeline()
    }

    /// Returns the idle connection pool cleanup task, if one is registered.
    pub fn cleanup_task(&self) -> Option<&CleanupRegistration> {
        self.transport.cleanup_task()
    }

    /// Returns the number of idle pooled connections.
    pub fn idle_connections(&self) -> usize {
        self.transport.pool().idle_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_uses_origin_form_and_sets_host() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("http://ignored.example.com/api/items?limit=5")
            .header("x-trace", "abc")
            .body(())
            .unwrap();
        let (parts, ()) = request.into_parts();
        let template = RequestTemplate::from_parts(parts);

        let built = template
            .build(&Endpoint::new("10.0.0.1", 8080), Bytes::from_static(b"{}"))
            .unwrap();
        assert_eq!(built.method(), Method::POST);
        assert_eq!(built.uri(), "/api/items?limit=5");
        assert_eq!(built.headers()[HOST], "10.0.0.1:8080");
        assert_eq!(built.headers()["x-trace"], "abc");
        assert_eq!(template.describe(), "POST /api/items?limit=5");
    }

    #[test]
    fn template_keeps_explicit_host() {
        let (parts, ()) = Request::builder()
            .uri("/")
            .header(HOST, "service.internal")
            .body(())
            .unwrap()
            .into_parts();

        let built = RequestTemplate::from_parts(parts)
            .build(&Endpoint::new("10.0.0.1", 8080), Bytes::new())
            .unwrap();
        assert_eq!(built.headers()[HOST], "service.internal");
    }

    #[test]
    fn missing_path_defaults_to_root() {
        assert_eq!(origin_form(&Uri::from_static("http://example.com")), "/");
    }
}
