//! Line framing and payload classification for the upstream event stream

use bytes::BytesMut;
use serde_json::Value;
use tracing::warn;

use crate::error::UpstreamError;

/// Longest line the decoder will hold while waiting for its newline
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into SSE `data:` payloads, buffering partial lines
/// across reads.
///
/// Lines longer than the cap are dropped whole, however the bytes arrive.
#[derive(Debug)]
pub struct SseLineDecoder {
    buffer: BytesMut,
    max_line: usize,
    /// Inside an overlong line whose head was already dropped
    discarding: bool,
}

impl Default for SseLineDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_line,
            discarding: false,
        }
    }

    /// Feed bytes and take every complete `data:` payload
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<String> {
        let mut payloads = Vec::new();

        if self.discarding {
            match data.iter().position(|&b| b == b'\n') {
                Some(line_end) => {
                    self.discarding = false;
                    data = &data[line_end + 1..];
                }
                None => return payloads,
            }
        }
        self.buffer.extend_from_slice(data);

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(line_end + 1);
            if line_end > self.max_line {
                warn!(bytes = line_end, "Dropping overlong upstream line");
                continue;
            }
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }

        if self.buffer.len() > self.max_line {
            warn!(
                bytes = self.buffer.len(),
                "Upstream line exceeds limit without a newline, dropping it"
            );
            self.buffer.clear();
            self.discarding = true;
        }

        payloads
    }

    /// Flush a trailing line that had no terminating newline
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buffer.split();
        if std::mem::take(&mut self.discarding) || rest.len() > self.max_line {
            return None;
        }
        data_payload(&rest)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    // event:, id:, comments and blank separators carry nothing we use
    line.strip_prefix("data:").map(|data| data.trim().to_string())
}

/// What one `data:` payload means
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLine {
    /// Text to append to the reply
    Fragment(String),
    /// Valid event without text (metadata, empty message)
    Empty,
    /// `[DONE]`
    Done,
    /// In-band error object
    Error(String),
    /// Not JSON
    Unparsable,
}

/// Classify a `data:` payload
pub fn classify_data(data: &str) -> DataLine {
    if data == "[DONE]" {
        return DataLine::Done;
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(_) => return DataLine::Unparsable,
    };
    if let Some(description) = error_marker(&value) {
        return DataLine::Error(description);
    }
    match value.get("message").and_then(Value::as_str) {
        Some(text) if !text.is_empty() => DataLine::Fragment(text.to_string()),
        _ => DataLine::Empty,
    }
}

/// Description of an in-band error, if `value` is one
pub fn error_marker(value: &Value) -> Option<String> {
    let is_error = value.get("action").and_then(Value::as_str) == Some("error")
        || value.get("error").is_some_and(|e| !e.is_null());
    if !is_error {
        return None;
    }

    let description = ["type", "error", "message"]
        .iter()
        .filter_map(|key| value.get(*key))
        .find(|v| !v.is_null())
        .map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Object(obj) => obj
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| v.to_string()),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "unknown upstream error".to_string());
    Some(description)
}

/// Assemble the reply text from a complete response body.
///
/// The result is trimmed and may be empty.
pub fn collect_reply(body: &str) -> Result<String, UpstreamError> {
    if let Ok(value) = serde_json::from_str::<Value>(body.trim()) {
        if let Some(description) = error_marker(&value) {
            return Err(UpstreamError::Reported(description));
        }
    }

    let mut reply = String::new();
    for line in body.lines() {
        let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") else {
            continue;
        };
        match classify_data(data.trim()) {
            DataLine::Fragment(text) => reply.push_str(&text),
            DataLine::Done => break,
            DataLine::Error(description) => return Err(UpstreamError::Reported(description)),
            DataLine::Empty | DataLine::Unparsable => {}
        }
    }

    Ok(reply.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_buffers_partial_lines() {
        let mut decoder = SseLineDecoder::new();
        assert!(decoder.feed(b"data: {\"mess").is_empty());
        let payloads = decoder.feed(b"age\": \"Hi\"}\n\ndata: [DO");
        assert_eq!(payloads, vec!["{\"message\": \"Hi\"}".to_string()]);
        assert_eq!(decoder.feed(b"NE]\r\n"), vec!["[DONE]".to_string()]);
    }

    #[test]
    fn test_decoder_skips_other_fields() {
        let mut decoder = SseLineDecoder::new();
        let payloads = decoder.feed(b"event: message\nid: 4\n: keepalive\ndata: x\n\n");
        assert_eq!(payloads, vec!["x".to_string()]);
    }

    #[test]
    fn test_decoder_finish_flushes_tail() {
        let mut decoder = SseLineDecoder::new();
        assert!(decoder.feed(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), Some("tail".to_string()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_decoder_drops_overlong_line() {
        let mut decoder = SseLineDecoder::with_max_line(16);
        assert!(decoder.feed(b"data: 0123456789").is_empty());
        // the pending line passes the cap and is dropped up to its newline
        assert!(decoder.feed(b"abcdefgh").is_empty());
        assert!(decoder.feed(&[b'x'; 64]).is_empty());
        assert_eq!(
            decoder.feed(b"tail\ndata: ok\n"),
            vec!["ok".to_string()]
        );

        // same outcome when the long line arrives in one read
        let mut decoder = SseLineDecoder::with_max_line(16);
        let payloads = decoder.feed(b"data: 0123456789abcdefgh\ndata: ok\n");
        assert_eq!(payloads, vec!["ok".to_string()]);

        let mut decoder = SseLineDecoder::with_max_line(16);
        decoder.feed(b"data: 0123456789abcdefgh");
        assert_eq!(decoder.finish(), None);
        assert_eq!(decoder.feed(b"data: ok\n"), vec!["ok".to_string()]);
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify_data(r#"{"message":"Hi","role":"assistant"}"#),
            DataLine::Fragment("Hi".to_string())
        );
        assert_eq!(classify_data(r#"{"message":""}"#), DataLine::Empty);
        assert_eq!(classify_data(r#"{"role":"assistant"}"#), DataLine::Empty);
        assert_eq!(classify_data("[DONE]"), DataLine::Done);
        assert_eq!(classify_data("not json"), DataLine::Unparsable);
        assert_eq!(
            classify_data(r#"{"action":"error","status":429,"type":"ERR_CONVERSATION_LIMIT"}"#),
            DataLine::Error("ERR_CONVERSATION_LIMIT".to_string())
        );
    }

    #[test]
    fn test_collect_reply() {
        let body = "data: {\"message\":\"Hi\"}\n\ndata: {\"message\":\" there\"}\n\ndata: [DONE]\n\n";
        assert_eq!(collect_reply(body).unwrap(), "Hi there");
    }

    #[test]
    fn test_collect_reply_skips_garbage() {
        let body = "data: {\"message\":\" a\"}\ndata: garbage\n\nrandom line\ndata: {\"message\":\"b \"}\n";
        assert_eq!(collect_reply(body).unwrap(), "ab");
    }

    #[test]
    fn test_collect_reply_error_body() {
        let err = collect_reply(r#"{"action":"error","type":"ERR_INVALID_VQD"}"#).unwrap_err();
        assert_eq!(err, UpstreamError::Reported("ERR_INVALID_VQD".to_string()));

        let err = collect_reply(r#"{"error":{"message":"boom"}}"#).unwrap_err();
        assert_eq!(err, UpstreamError::Reported("boom".to_string()));
    }

    #[test]
    fn test_collect_reply_in_stream_error() {
        let body = "data: {\"message\":\"Hi\"}\n\ndata: {\"action\":\"error\",\"type\":\"overloaded\"}\n\n";
        assert!(matches!(
            collect_reply(body),
            Err(UpstreamError::Reported(_))
        ));
    }

    #[test]
    fn test_collect_reply_empty() {
        assert_eq!(collect_reply("").unwrap(), "");
        assert_eq!(collect_reply("data: [DONE]\n").unwrap(), "");
    }
}
