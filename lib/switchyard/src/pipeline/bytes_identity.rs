use bytes::{Bytes, BytesMut};
use switchyard_config::GenericError;

use super::PipelineStrategy;
use crate::client::Protocol;

/// A pass-through pipeline over raw bytes.
///
/// Requests are written as-is. On stream transports, everything buffered so far is handed back as a single response as
/// soon as any bytes have arrived.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesPipeline;

impl PipelineStrategy for BytesPipeline {
    type Request = Bytes;
    type Response = Bytes;

    fn name(&self) -> &'static str {
        "bytes"
    }

    fn protocols(&self) -> &'static [Protocol] {
        &[Protocol::Tcp, Protocol::Udp, Protocol::Http]
    }

    fn encode(&self, request: Bytes) -> Result<Bytes, GenericError> {
        Ok(request)
    }

    fn decode(&self, buf: &mut BytesMut, is_eof: bool) -> Result<Option<Bytes>, GenericError> {
        if buf.is_empty() && !is_eof {
            return Ok(None);
        }

        Ok(Some(buf.split().freeze()))
    }
}
