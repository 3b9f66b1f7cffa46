use std::sync::Arc;

use async_stream::stream;
use bytes::BytesMut;
use futures::stream::BoxStream;
use http::Request;
use http_body_util::BodyExt as _;

use super::{http::HttpTransport, ClientParts, Protocol};
use crate::{
    config::ClientConfiguration,
    endpoint::LoadBalancer,
    error::{RequestError, Stream},
    pipeline::Pipeline,
    pool::CleanupRegistration,
    retry::{Failure, FailureKind, RetryPolicy},
};

/// A stream of decoded events.
pub type EventStream<O> = BoxStream<'static, Result<O, RequestError>>;

/// A server-sent events client.
///
/// Establishing the stream (connecting, and receiving a successful response head) is retried according to the retry
/// policy. Once established, events are decoded from the response body as it arrives, and a failure ends the stream
/// with a single error. When the server ends the stream cleanly, the connection goes back to the pool.
pub struct SseClient<I, O> {
    transport: HttpTransport<I, O>,
}

impl<I: 'static, O: Send + 'static> SseClient<I, O> {
    pub(crate) fn new(parts: ClientParts<I, O>) -> Self {
        Self {
            transport: HttpTransport::new(Protocol::Sse, parts),
        }
    }

    /// Opens an event stream.
    ///
    /// The pipeline may add headers to the request, such as `Accept: text/event-stream`.
    ///
    /// # Errors
    ///
    /// If the request body cannot be encoded, or every permitted attempt to establish the stream fails, an error will
    /// be returned.
    pub async fn execute(&self, request: Request<I>) -> Result<EventStream<O>, RequestError> {
        let (template, payload) = self.transport.encode(request)?;
        let (endpoint, (response, connection)) = self
            .transport
            .executor()
            .run(|endpoint| {
                let template = &template;
                let payload = payload.clone();
                async move { self.transport.send(&endpoint, template, payload).await }
            })
            .await?;

        let pipeline = Arc::clone(self.transport.pipeline());
        let pool = Arc::clone(self.transport.pool());
        let mut body = response.into_body();

        let events = stream! {
            let mut buf = BytesMut::new();

            loop {
                match body.frame().await {
                    Some(Ok(frame)) => {
                        let Ok(data) = frame.into_data() else {
                            continue;
                        };
                        buf.extend_from_slice(&data);

                        loop {
                            match pipeline.decode(&mut buf, false) {
                                Ok(Some(event)) => yield Ok(event),
                                Ok(None) => break,
                                Err(e) => {
                                    yield Err(Stream {
                                        endpoint,
                                        failure: Failure::new(FailureKind::Codec, e),
                                    }
                                    .build());
                                    return;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(Stream {
                            endpoint,
                            failure: Failure::new(FailureKind::ConnectionClosed, e),
                        }
                        .build());
                        return;
                    }
                    None => break,
                }
            }

            while !buf.is_empty() {
                match pipeline.decode(&mut buf, true) {
                    Ok(Some(event)) => yield Ok(event),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(Stream {
                            endpoint,
                            failure: Failure::new(FailureKind::Codec, e),
                        }
                        .build());
                        return;
                    }
                }
            }

            pool.checkin(endpoint, connection);
        };

        Ok(Box::pin(events))
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
