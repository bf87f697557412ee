//! LSP-style framing for JSON-RPC messages over stdio.
//!
//! Each message is a header section terminated by a blank line (`\r\n\r\n`)
//! followed by a UTF-8 JSON body of exactly `Content-Length` bytes. Only the
//! `Content-Length` header is significant; all other headers are ignored.

use serde_json::Value;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Encode a JSON value as a single framed message.
pub fn encode_message(value: &Value) -> Vec<u8> {
    let body = value.to_string().into_bytes();
    let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend_from_slice(&body);
    out
}

/// Incremental decoder for a stream of framed messages.
///
/// Bytes are appended as they arrive from the wire; [`FrameBuffer::try_next`]
/// greedily parses out complete frames and leaves any partial frame in the
/// buffer until more bytes show up.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Parse the next complete frame out of the buffer, if one is available.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial header or
    /// fewer body bytes than the declared `Content-Length`. A complete frame
    /// whose body is not valid JSON is an error.
    pub fn try_next(&mut self) -> Result<Option<Value>, serde_json::Error> {
        let Some(header_end) = find_subsequence(&self.buf, HEADER_SEPARATOR) else {
            return Ok(None);
        };

        let header_text = String::from_utf8_lossy(&self.buf[..header_end]).into_owned();
        let Some(content_length) = parse_content_length(&header_text) else {
            // No usable Content-Length yet; the caller's deadline bounds this.
            return Ok(None);
        };

        let body_start = header_end + HEADER_SEPARATOR.len();
        let body_end = body_start + content_length;
        if self.buf.len() < body_end {
            return Ok(None);
        }

        let value = serde_json::from_slice(&self.buf[body_start..body_end])?;
        self.buf.drain(..body_end);
        Ok(Some(value))
    }
}

fn parse_content_length(header_text: &str) -> Option<usize> {
    for line in header_text.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("content-length") {
            return value.trim().parse::<usize>().ok();
        }
    }
    None
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn encode_declares_exact_body_length() {
        let value = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        let encoded = encode_message(&value);
        let text = String::from_utf8(encoded.clone()).expect("utf-8");
        let (header, body) = text.split_once("\r\n\r\n").expect("separator");
        let declared: usize = header
            .trim_start_matches("Content-Length:")
            .trim()
            .parse()
            .expect("length");
        assert_eq!(declared, body.len());

        let mut buffer = FrameBuffer::new();
        buffer.extend(&encoded);
        let decoded = buffer.try_next().expect("parse").expect("frame");
        assert_eq!(decoded, value);
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_reads_yield_exactly_one_message() {
        let value = json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}});
        let encoded = encode_message(&value);

        // Split points chosen so the first chunk ends mid-header.
        let splits = [5usize, encoded.len() - 3];
        let mut buffer = FrameBuffer::new();

        buffer.extend(&encoded[..splits[0]]);
        assert_eq!(buffer.try_next().expect("parse"), None);

        buffer.extend(&encoded[splits[0]..splits[1]]);
        assert_eq!(buffer.try_next().expect("parse"), None);

        buffer.extend(&encoded[splits[1]..]);
        let decoded = buffer.try_next().expect("parse").expect("frame");
        assert_eq!(decoded, value);
        assert_eq!(buffer.try_next().expect("parse"), None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn parses_frames_greedily() {
        let first = json!({"id": 1});
        let second = json!({"id": 2});
        let mut bytes = encode_message(&first);
        bytes.extend_from_slice(&encode_message(&second));

        let mut buffer = FrameBuffer::new();
        buffer.extend(&bytes);
        assert_eq!(buffer.try_next().expect("parse"), Some(first));
        assert_eq!(buffer.try_next().expect("parse"), Some(second));
        assert!(buffer.is_empty());
    }

    #[test]
    fn ignores_headers_other_than_content_length() {
        let value = json!({"id": 3});
        let body = value.to_string();
        let framed = format!(
            "X-Extra: yes\r\ncontent-length: {}\r\nAnother: header\r\n\r\n{body}",
            body.len()
        );

        let mut buffer = FrameBuffer::new();
        buffer.extend(framed.as_bytes());
        assert_eq!(buffer.try_next().expect("parse"), Some(value));
    }

    #[test]
    fn waits_for_body_bytes() {
        let framed = b"Content-Length: 10\r\n\r\n{\"a\"";
        let mut buffer = FrameBuffer::new();
        buffer.extend(framed);
        assert_eq!(buffer.try_next().expect("parse"), None);
        buffer.extend(b":1234}");
        assert_eq!(buffer.try_next().expect("parse"), Some(json!({"a": 1234})));
    }
}
