use std::time::Duration;

use bytes::{Buf as _, Bytes, BytesMut};
use http::{
    header::{ACCEPT, CACHE_CONTROL},
    HeaderMap, HeaderValue,
};
use memchr::{memchr, memmem};
use switchyard_config::GenericError;

use super::PipelineStrategy;
use crate::client::Protocol;

/// A single server-sent event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerSentEvent {
    /// Event type, from the `event` field.
    pub event_type: Option<String>,

    /// Event payload. Multiple `data` lines are joined with a newline.
    pub data: String,

    /// Event ID, from the `id` field.
    pub id: Option<String>,

    /// Reconnection delay requested by the server, from the `retry` field.
    pub retry: Option<Duration>,
}

/// A pipeline for `text/event-stream` responses.
///
/// Requests are sent as raw bytes. Responses are split into events on blank lines, with either LF or CRLF line endings.
/// Comment lines (starting with `:`) and unknown fields are skipped, and blocks without any `data` field do not produce
/// an event. An unterminated event at the end of the stream is still emitted.
#[derive(Clone, Debug, Default)]
pub struct ServerSentEventPipeline {
    _priv: (),
}

impl ServerSentEventPipeline {
    /// Creates a new `ServerSentEventPipeline`.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl PipelineStrategy for ServerSentEventPipeline {
    type Request = Bytes;
    type Response = ServerSentEvent;

    fn name(&self) -> &'static str {
        "server-sent-events"
    }

    fn protocols(&self) -> &'static [Protocol] {
        &[Protocol::Sse]
    }

    fn prepare_headers(&self, headers: &mut HeaderMap) {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }

    fn encode(&self, request: Bytes) -> Result<Bytes, GenericError> {
        Ok(request)
    }

    fn decode(&self, buf: &mut BytesMut, is_eof: bool) -> Result<Option<ServerSentEvent>, GenericError> {
        loop {
            if !is_eof && !has_event_boundary(buf) {
                return Ok(None);
            }

            let mut event = PartialEvent::default();
            let mut pos = 0;
            let mut boundary = None;

            while let Some(idx) = memchr(b'\n', &buf[pos..]) {
                let line = trim_carriage_return(&buf[pos..pos + idx]);
                pos += idx + 1;

                if line.is_empty() {
                    boundary = Some(pos);
                    break;
                }
                event.push_line(line)?;
            }

            match boundary {
                Some(consumed) => {
                    buf.advance(consumed);

                    // Blocks holding only comments or empty fields are dropped, and we move on to the next one.
                    if let Some(event) = event.finish() {
                        return Ok(Some(event));
                    }
                }
                None => {
                    if !is_eof {
                        return Ok(None);
                    }

                    if pos < buf.len() {
                        event.push_line(trim_carriage_return(&buf[pos..]))?;
                    }
                    buf.clear();

                    return Ok(event.finish());
                }
            }
        }
    }
}

fn has_event_boundary(buf: &[u8]) -> bool {
    buf.starts_with(b"\n")
        || buf.starts_with(b"\r\n")
        || memmem::find(buf, b"\n\n").is_some()
        || memmem::find(buf, b"\n\r\n").is_some()
}

fn trim_carriage_return(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[derive(Default)]
struct PartialEvent {
    event_type: Option<String>,
    data: Option<String>,
    id: Option<String>,
    retry: Option<Duration>,
}

impl PartialEvent {
    fn push_line(&mut self, line: &[u8]) -> Result<(), GenericError> {
        let line = std::str::from_utf8(line)?;
        if line.starts_with(':') {
            return Ok(());
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            "retry" => {
                if let Ok(millis) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(millis));
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn finish(self) -> Option<ServerSentEvent> {
        let data = self.data?;
        Some(ServerSentEvent {
            event_type: self.event_type,
            data,
            id: self.id,
            retry: self.retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn decode_all(input: &[u8]) -> Vec<ServerSentEvent> {
        let pipeline = ServerSentEventPipeline::new();
        let mut buf = BytesMut::from(input);
        let mut events = Vec::new();
        while let Some(event) = pipeline.decode(&mut buf, true).unwrap() {
            events.push(event);
        }
        events
    }

    fn data(data: &str) -> ServerSentEvent {
        ServerSentEvent {
            data: data.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn sets_stream_headers() {
        let mut headers = HeaderMap::new();
        ServerSentEventPipeline::new().prepare_headers(&mut headers);

        assert_eq!(headers[ACCEPT], "text/event-stream");
        assert_eq!(headers[CACHE_CONTROL], "no-cache");
    }

    #[test]
    fn waits_for_blank_line() {
        let pipeline = ServerSentEventPipeline::new();
        let mut buf = BytesMut::from(&b"data: partial\n"[..]);

        assert_eq!(pipeline.decode(&mut buf, false).unwrap(), None);
        assert_eq!(&buf[..], b"data: partial\n");

        buf.extend_from_slice(b"\n");
        assert_eq!(pipeline.decode(&mut buf, false).unwrap(), Some(data("partial")));
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_event_is_not_parsed() {
        let pipeline = ServerSentEventPipeline::new();
        let mut buf = BytesMut::from(&b"data: \xff\r\nid: 7"[..]);

        // The invalid byte is only seen once the event is complete.
        assert_eq!(pipeline.decode(&mut buf, false).unwrap(), None);
        assert_eq!(buf.len(), 14);

        buf.extend_from_slice(b"\r\n\r\n");
        assert!(pipeline.decode(&mut buf, false).is_err());
    }

    #[test]
    fn leading_blank_lines_are_boundaries() {
        let pipeline = ServerSentEventPipeline::new();
        let mut buf = BytesMut::from(&b"\r\n\ndata: next"[..]);

        assert_eq!(pipeline.decode(&mut buf, false).unwrap(), None);
        assert_eq!(&buf[..], b"data: next");

        buf.extend_from_slice(b"\n\n");
        assert_eq!(pipeline.decode(&mut buf, false).unwrap(), Some(data("next")));
        assert!(buf.is_empty());
    }

    #[test]
    fn parses_all_fields() {
        let events = decode_all(b"event: update\nid: 42\nretry: 1500\ndata: first\ndata: second\n\n");

        assert_eq!(
            events,
            vec![ServerSentEvent {
                event_type: Some("update".to_string()),
                data: "first\nsecond".to_string(),
                id: Some("42".to_string()),
                retry: Some(Duration::from_millis(1500)),
            }]
        );
    }

    #[test]
    fn skips_comments_and_empty_blocks() {
        let events = decode_all(b": keepalive\n\nevent: ping\n\ndata:one\n\n: trailing\ndata: two\n\n");
        assert_eq!(events, vec![data("one"), data("two")]);
    }

    #[test]
    fn handles_crlf_line_endings() {
        let events = decode_all(b"data: a\r\n\r\ndata: b\r\n\r\n");
        assert_eq!(events, vec![data("a"), data("b")]);
    }

    #[test]
    fn ignores_invalid_fields() {
        let events = decode_all(b"retry: soon\nid: a\0b\nunknown: x\ndata\n\n");
        assert_eq!(events, vec![data("")]);
    }

    #[test]
    fn emits_unterminated_event_at_eof() {
        let pipeline = ServerSentEventPipeline::new();
        let mut buf = BytesMut::from(&b"data: last"[..]);

        assert_eq!(pipeline.decode(&mut buf, false).unwrap(), None);
        assert_eq!(pipeline.decode(&mut buf, true).unwrap(), Some(data("last")));
        assert_eq!(pipeline.decode(&mut buf, true).unwrap(), None);
    }

    #[test]
    fn rejects_invalid_utf8() {
        let pipeline = ServerSentEventPipeline::new();
        let mut buf = BytesMut::from(&b"data: \xff\xfe\n\n"[..]);

        assert!(pipeline.decode(&mut buf, false).is_err());
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_events(
            payloads in proptest::collection::vec("[a-z0-9 ]{0,12}", 1..6),
            split_points in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let mut stream = Vec::new();
            for (i, payload) in payloads.iter().enumerate() {
                stream.extend_from_slice(format!(": note {}\nid: {}\ndata: {}\n\n", i, i, payload).as_bytes());
            }

            let mut splits = split_points.iter().map(|idx| idx.index(stream.len())).collect::<Vec<_>>();
            splits.push(stream.len());
            splits.sort_unstable();

            let pipeline = ServerSentEventPipeline::new();
            let mut buf = BytesMut::new();
            let mut events = Vec::new();
            let mut start = 0;
            for end in splits {
                buf.extend_from_slice(&stream[start..end]);
                start = end;
                while let Some(event) = pipeline.decode(&mut buf, false).unwrap() {
                    events.push(event);
                }
            }

            prop_assert_eq!(events, decode_all(&stream));
            prop_assert_eq!(decode_all(&stream).len(), payloads.len());
        }
    }
}
