//! Newline framing.

use serde::Serialize;

use crate::envelope::Response;

/// Serialize a value as a single JSON line terminated by `\n`.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Accumulates raw bytes from a stream and hands out complete lines.
///
/// A trailing line without its newline stays buffered until more bytes
/// arrive; it is never reported as malformed.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    // Prefix of `buf` already known to hold no newline.
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the stream.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of bytes not yet returned as a line.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop the next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let Some(found) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') else {
            self.scanned = self.buf.len();
            return None;
        };
        let pos = self.scanned + found;
        self.scanned = 0;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Pop complete lines until one parses as a response envelope.
    ///
    /// Lines that do not parse are discarded. Returns `None` when the buffer
    /// holds no further complete line.
    pub fn next_response(&mut self) -> Option<Response> {
        while let Some(line) = self.next_line() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(resp) = Response::parse(&line) {
                return Some(resp);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Outcome, Request};
    use serde_json::json;

    #[test]
    fn test_encode_line_ends_with_single_newline() {
        let req = Request::new("1", "execute_command", json!({"command": "echo 'a\nb'"}));
        let line = encode_line(&req).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_partial_line_is_buffered() {
        let mut buf = LineBuffer::new();
        buf.extend(br#"{"id":"1","res"#);
        assert!(buf.next_response().is_none());
        assert!(!buf.is_empty());

        buf.extend(b"ult\":42}\n");
        let resp = buf.next_response().unwrap();
        assert_eq!(resp.id, "1");
        assert_eq!(resp.outcome, Outcome::Result(json!(42)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_skips_unparseable_lines() {
        let mut buf = LineBuffer::new();
        buf.extend(b"warming up\n\n{\"id\":\"2\",\"error\":\"nope\"}\n");
        let resp = buf.next_response().unwrap();
        assert_eq!(resp.outcome, Outcome::Error("nope".into()));
    }

    #[test]
    fn test_first_valid_line_wins() {
        let mut buf = LineBuffer::new();
        buf.extend(b"{\"id\":\"a\",\"result\":1}\n{\"id\":\"b\",\"result\":2}\n");
        assert_eq!(buf.next_response().unwrap().id, "a");
        assert_eq!(buf.next_response().unwrap().id, "b");
    }

    #[test]
    fn test_crlf_terminated_line() {
        let mut buf = LineBuffer::new();
        buf.extend(b"{\"id\":\"a\",\"result\":true}\r\n");
        assert_eq!(buf.next_line().unwrap(), "{\"id\":\"a\",\"result\":true}");
    }

    #[test]
    fn test_long_line_in_small_chunks_is_scanned_once() {
        let payload = "x".repeat(8 * 1024 * 1024);
        let line = encode_line(&json!({"id": "big", "result": payload})).unwrap();
        let bytes = line.as_bytes();

        let mut buf = LineBuffer::new();
        let mut chunks = bytes.chunks(16 * 1024).peekable();
        while let Some(chunk) = chunks.next() {
            buf.extend(chunk);
            if chunks.peek().is_some() {
                assert!(buf.next_response().is_none());
                // Bytes already searched are not searched again.
                assert_eq!(buf.scanned, buf.len());
            }
        }

        let resp = buf.next_response().unwrap();
        assert_eq!(resp.id, "big");
        match resp.outcome {
            Outcome::Result(value) => assert_eq!(value.as_str().unwrap().len(), 8 * 1024 * 1024),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(buf.is_empty());
        assert_eq!(buf.scanned, 0);
    }

    #[test]
    fn test_line_after_buffered_partial_is_found() {
        let mut buf = LineBuffer::new();
        buf.extend(b"{\"id\":\"a\",");
        assert!(buf.next_line().is_none());
        buf.extend(b"\"result\":1}\n{\"id\":\"b\"");
        assert_eq!(buf.next_line().unwrap(), "{\"id\":\"a\",\"result\":1}");
        assert!(buf.next_line().is_none());
        buf.extend(b",\"result\":2}\n");
        assert_eq!(buf.next_response().unwrap().id, "b");
    }
}
