use super::logging::emit_sse_parse_error;
use crate::types::UpstreamEvent;

const KNOWN_EVENT_TYPES: &[&str] = &[
    "message_start",
    "content_block_start",
    "content_block_delta",
    "content_block_stop",
    "message_delta",
    "message_stop",
    "ping",
    "error",
];

/// Incremental decoder for the Messages API server-sent event stream.
///
/// Bytes are buffered until a full `\n\n`-terminated event is available, so
/// multi-byte characters split across network chunks decode correctly.
#[derive(Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, chunk: &[u8]) -> Vec<UpstreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;

        while let Some((end, separator_len)) = find_event_boundary(&self.buffer[start..]) {
            let event_end = start + end + separator_len;
            let event_text = String::from_utf8_lossy(&self.buffer[start..start + end]).into_owned();
            start = event_end;

            if let Some(event) = parse_event_block(&event_text) {
                events.push(event);
            }
        }

        if start > 0 {
            self.buffer.drain(..start);
        }

        events
    }

    /// Returns whatever trailing bytes never formed a complete event.
    pub fn flush(&mut self) -> String {
        let rest = std::mem::take(&mut self.buffer);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_event_block(event_text: &str) -> Option<UpstreamEvent> {
    let mut event_type: Option<&str> = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in event_text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("event:") {
            event_type = Some(rest.trim());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    let json_data = data_lines.join("\n");
    let json_data = json_data.trim();
    if json_data == "[DONE]" {
        return None;
    }
    if let Some(evt_type) = event_type {
        if !KNOWN_EVENT_TYPES.contains(&evt_type) {
            tracing::trace!(event_type = evt_type, "skipping unhandled sse event");
            return None;
        }
    }

    match serde_json::from_str::<UpstreamEvent>(json_data) {
        Ok(evt) => Some(evt),
        Err(e) => {
            emit_sse_parse_error(event_type, json_data, &e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let mut parser = StreamParser::new();
        let event = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"caf\u{e9}\"}}\n\n";
        let bytes = event.as_bytes();
        let split = event.find('\u{e9}').unwrap() + 1;

        assert!(parser.process(&bytes[..split]).is_empty());
        let events = parser.process(&bytes[split..]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            UpstreamEvent::ContentBlockDelta { delta, .. } => {
                assert_eq!(delta.text.as_deref(), Some("caf\u{e9}"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_crlf_separated_events() {
        let mut parser = StreamParser::new();
        let events = parser.process(b"event: ping\r\ndata: {\"type\":\"ping\"}\r\n\r\n");
        assert_eq!(events, vec![UpstreamEvent::Ping]);
    }

    #[test]
    fn test_flush_returns_incomplete_tail() {
        let mut parser = StreamParser::new();
        assert!(parser
            .process(b"event: message_stop\ndata: {\"type\":\"mess")
            .is_empty());
        assert_eq!(
            parser.flush(),
            "event: message_stop\ndata: {\"type\":\"mess"
        );
        assert_eq!(parser.flush(), "");
    }
}
