//! `text/event-stream` framing.
//!
//! Outbound frames are a single `data: <json>` line followed by a blank
//! line. The decoder accepts what browsers accept: `\n`, `\r\n` or `\r`
//! line endings, multi-line `data` fields, and comment lines.

use axum::response::sse::Event;

use crate::models::DomainEvent;

pub fn to_sse_event(event: &DomainEvent) -> Event {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().data(json)
}

/// Wire form of one event, as written by [`to_sse_event`].
pub fn encode_frame(event: &DomainEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("data: {json}\n\n")
}

/// Incremental decoder: feed arbitrary byte chunks, get complete `data`
/// payloads back.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        while let Some((line, rest)) = split_line(&self.buffer) {
            let line = line.to_string();
            self.buffer = rest.to_string();
            if let Some(payload) = self.line(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    fn line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let payload = self.data.join("\n");
            self.data.clear();
            return Some(payload);
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }
}

fn split_line(buffer: &str) -> Option<(&str, &str)> {
    let idx = buffer.find(['\n', '\r'])?;
    let rest = &buffer[idx..];
    if rest.starts_with("\r\n") {
        Some((&buffer[..idx], &rest[2..]))
    } else if rest.starts_with('\r') && rest.len() == 1 {
        // lone \r at the end of a chunk may be the first half of \r\n
        None
    } else {
        Some((&buffer[..idx], &rest[1..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventKind;

    #[test]
    fn frame_has_no_id_field() {
        let frame = encode_frame(&DomainEvent::connected());
        assert!(frame.starts_with("data: {\"type\":\"connected\""));
        assert!(frame.ends_with("\n\n"));
        assert!(!frame.contains("id:"));
    }

    #[test]
    fn decodes_frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let frame = encode_frame(&DomainEvent::ping());
        let (a, b) = frame.split_at(10);

        assert!(decoder.push(a.as_bytes()).is_empty());
        let payloads = decoder.push(b.as_bytes());
        assert_eq!(payloads.len(), 1);

        let event: DomainEvent = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(event.kind, EventKind::Ping);
    }

    #[test]
    fn handles_comments_crlf_and_multiline_data() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b": keep-alive\r\n\r\ndata: line one\r\ndata: line two\r\n\r\nevent: x\ndata:{}\n\n");
        assert_eq!(payloads, vec!["line one\nline two".to_string(), "{}".to_string()]);
    }

    #[test]
    fn carriage_return_split_between_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: a\r").is_empty());
        assert!(decoder.push(b"\n\r").is_empty());
        assert_eq!(decoder.push(b"\n"), vec!["a".to_string()]);
    }
}
