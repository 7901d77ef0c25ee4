//! Data-channel frame decoding.
//!
//! Data channels deliver newline-delimited text. Lines are split on raw bytes
//! before UTF-8 decoding so a multi-byte character spanning two chunks is
//! reassembled intact. Each non-empty line is one JSON object; SSE framing
//! (`data:` prefixes, comments, `event:`/`id:`/`retry:` fields) is tolerated.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BytesMut};
use serde_json::Value;

/// Incremental line splitter for chunked response bodies.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
}

impl LineDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos);
            self.buffer.advance(1);
            lines.push(decode_line(&line));
        }
        lines
    }

    /// Flushes a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        Some(decode_line(&rest))
    }

    /// Number of buffered bytes not yet forming a line.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Parses one line into a frame.
///
/// Returns `Ok(None)` for lines that carry no frame (blank lines, SSE
/// comments and non-data SSE fields).
pub fn parse_frame(line: &str) -> ProtocolResult<Option<Value>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }
    if ["event:", "id:", "retry:"]
        .iter()
        .any(|field| line.starts_with(field))
    {
        return Ok(None);
    }
    let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if payload.is_empty() {
        return Ok(None);
    }
    parse_object(payload).map(Some)
}

/// Parses a complete non-streaming response body as a single frame.
pub fn parse_body(body: &[u8]) -> ProtocolResult<Value> {
    parse_object(String::from_utf8_lossy(body).trim())
}

fn parse_object(text: &str) -> ProtocolResult<Value> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn splits_lines_across_chunks() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"{\"a\":").is_empty());
        let lines = decoder.push(b"1}\n{\"b\":2}\r\n{\"c\"");
        assert_eq!(lines, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
        assert_eq!(decoder.pending(), 4);
        assert_eq!(decoder.push(b":3}\n"), vec![r#"{"c":3}"#]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn multibyte_character_split_between_chunks() {
        let text = "{\"name\":\"r\u{e9}seau\"}\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(&text[..split]).is_empty());
        let lines = decoder.push(&text[split..]);
        assert_eq!(lines, vec!["{\"name\":\"r\u{e9}seau\"}"]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"{\"tail\":true}");
        assert_eq!(decoder.finish().as_deref(), Some(r#"{"tail":true}"#));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn sse_framing_is_tolerated() {
        assert_eq!(parse_frame(": keepalive").unwrap(), None);
        assert_eq!(parse_frame("event: update").unwrap(), None);
        assert_eq!(parse_frame("   ").unwrap(), None);
        let value = parse_frame(r#"data: {"op":"add"}"#).unwrap().unwrap();
        assert_eq!(value["op"], "add");
    }

    #[test]
    fn malformed_and_non_object_frames_fail() {
        assert!(matches!(parse_frame("{oops"), Err(ProtocolError::Json(_))));
        assert!(matches!(parse_frame("[1,2]"), Err(ProtocolError::NotAnObject)));
    }

    #[test]
    fn whole_body_may_span_lines() {
        let body = b"{\n  \"rows\": [1, 2]\n}\n";
        let value = parse_body(body).unwrap();
        assert_eq!(value["rows"][1], 2);
    }

    proptest! {
        #[test]
        fn chunk_boundaries_do_not_change_lines(
            lines in proptest::collection::vec("[a-z0-9 {}:\"\u{e9}]{0,24}", 0..12),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let mut text = String::new();
            for line in &lines {
                text.push_str(line);
                text.push('\n');
            }
            let bytes = text.as_bytes();

            let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            offsets.push(0);
            offsets.push(bytes.len());
            offsets.sort_unstable();
            offsets.dedup();

            let mut decoder = LineDecoder::new();
            let mut out = Vec::new();
            for pair in offsets.windows(2) {
                out.extend(decoder.push(&bytes[pair[0]..pair[1]]));
            }
            prop_assert_eq!(decoder.finish(), None);
            prop_assert_eq!(out, lines);
        }
    }
}
