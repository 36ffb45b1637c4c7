//! Incremental Server-Sent Events decoding.
//!
//! Used by both model drivers and by the legacy MCP SSE transport. Bytes are
//! pushed as they arrive; complete frames (terminated by a blank line) are
//! returned, partial frames stay buffered.

/// One decoded SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

impl SseFrame {
    /// Event type with the SSE default applied.
    #[must_use]
    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((pos, sep_len)) = find_double_newline(&self.buf) {
            let raw = self.buf.drain(..pos + sep_len).collect::<Vec<_>>();
            let text = String::from_utf8_lossy(&raw[..pos]);
            if let Some(frame) = parse_frame(&text) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let raw = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&raw);
        parse_frame(&text)
    }
}

/// Find the first blank-line separator, returning its offset and length.
fn find_double_newline(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(text: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => frame.event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if data_lines.is_empty() && frame.event.is_none() {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_split_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: {\"a\":").is_empty());
        let frames = dec.push(b"1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[0].event_type(), "message");
        assert_eq!(frames[1].data, "[DONE]");
    }

    #[test]
    fn test_named_events_and_crlf() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b"event: endpoint\r\ndata: /messages?session_id=42\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type(), "endpoint");
        assert_eq!(frames[0].data, "/messages?session_id=42");
    }

    #[test]
    fn test_comments_are_ignored_and_multiline_data_joined() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b": keep-alive\n\ndata: one\ndata: two\n\n");
        assert_eq!(frames, vec![SseFrame { event: None, data: "one\ntwo".into() }]);
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: tail").is_empty());
        assert_eq!(dec.finish().map(|f| f.data), Some("tail".to_string()));
        assert_eq!(dec.finish(), None);
    }
}
