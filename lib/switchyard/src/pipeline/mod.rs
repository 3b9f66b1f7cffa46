//! Wire pipelines.
//!
//! A pipeline turns typed requests into bytes and bytes back into typed responses. Each client is bound to one
//! pipeline for its lifetime. Pipelines declare which protocols they are built for, and the factory refuses to bind a
//! pipeline to a client of any other protocol.

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use switchyard_config::GenericError;

use crate::{
    client::Protocol,
    error::{ClientError, IncompatiblePipeline},
};

mod bytes_identity;
pub use self::bytes_identity::BytesPipeline;

mod sse;
pub use self::sse::{ServerSentEvent, ServerSentEventPipeline};

/// Encoding and decoding behavior for a client.
pub trait PipelineStrategy: fmt::Debug + Send + Sync {
    /// The request type accepted by clients using this pipeline.
    type Request;

    /// The response type produced by clients using this pipeline.
    type Response;

    /// Name of the pipeline, for logs and errors.
    fn name(&self) -> &'static str;

    /// Protocols this pipeline is built for.
    fn protocols(&self) -> &'static [Protocol];

    /// Adjusts outgoing HTTP request headers.
    ///
    /// Called for every attempt made by HTTP and SSE clients. Does nothing by default.
    fn prepare_headers(&self, _headers: &mut HeaderMap) {}

    /// Encodes a request into its wire form.
    ///
    /// # Errors
    ///
    /// If the request cannot be encoded, an error will be returned.
    fn encode(&self, request: Self::Request) -> Result<Bytes, GenericError>;

    /// Decodes the next response from `buf`, consuming the bytes it used.
    ///
    /// Returns `Ok(None)` if `buf` does not hold a complete response yet. When `is_eof` is `true`, no more bytes will
    /// arrive, so any complete response must be returned now.
    ///
    /// # Errors
    ///
    /// If the buffered bytes are not a valid response, an error will be returned.
    fn decode(&self, buf: &mut BytesMut, is_eof: bool) -> Result<Option<Self::Response>, GenericError>;
}

/// A shared handle to a pipeline.
pub type Pipeline<I, O> = Arc<dyn PipelineStrategy<Request = I, Response = O>>;

/// Which pipeline a client should use.
pub enum PipelineChoice<I, O> {
    /// The protocol's built-in pipeline, produced by the given constructor.
    ProtocolDefault(fn() -> Pipeline<I, O>),

    /// A caller-supplied pipeline.
    Explicit(Pipeline<I, O>),
}

impl<I, O> fmt::Debug for PipelineChoice<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolDefault(_) => f.debug_tuple("ProtocolDefault").finish(),
            Self::Explicit(pipeline) => f.debug_tuple("Explicit").field(&pipeline.name()).finish(),
        }
    }
}

/// Resolves the pipeline for a client of the given protocol.
///
/// An explicit pipeline is returned unchanged once it is confirmed to be built for `protocol`. Otherwise the
/// protocol's default pipeline is returned.
///
/// # Errors
///
/// If an explicit pipeline does not declare support for `protocol`, an error will be returned.
pub fn resolve<I, O>(protocol: Protocol, choice: PipelineChoice<I, O>) -> Result<Pipeline<I, O>, ClientError> {
    match choice {
        PipelineChoice::ProtocolDefault(default) => Ok(default()),
        PipelineChoice::Explicit(pipeline) => {
            if pipeline.protocols().contains(&protocol) {
                Ok(pipeline)
            } else {
                IncompatiblePipeline {
                    pipeline: pipeline.name(),
                    protocol,
                    supported: pipeline
                        .protocols()
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", "),
                }
                .fail()
            }
        }
    }
}

/// Returns the shared identity byte pipeline, the default for TCP, UDP and HTTP clients.
pub fn bytes_pipeline() -> Pipeline<Bytes, Bytes> {
    static PIPELINE: OnceLock<Arc<BytesPipeline>> = OnceLock::new();
    let pipeline: Arc<BytesPipeline> = Arc::clone(PIPELINE.get_or_init(|| Arc::new(BytesPipeline)));
    pipeline
}

/// Returns the shared server-sent event pipeline, the default for SSE clients.
pub fn sse_pipeline() -> Pipeline<Bytes, ServerSentEvent> {
    static PIPELINE: OnceLock<Arc<ServerSentEventPipeline>> = OnceLock::new();
    let pipeline: Arc<ServerSentEventPipeline> =
        Arc::clone(PIPELINE.get_or_init(|| Arc::new(ServerSentEventPipeline::new())));
    pipeline
}
