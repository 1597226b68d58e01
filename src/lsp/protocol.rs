/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! JSON-RPC envelopes and `Content-Length` framing.
//!
//! Outbound messages are serialized with [`encode`]. Inbound bytes are
//! pushed through a [`FrameDecoder`], which tolerates arbitrary chunk
//! boundaries and recovers from malformed frames by resynchronizing on the
//! next header.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::{trace, warn};

/// The only JSON-RPC version spoken on the wire.
pub const JSONRPC_VERSION: &str = "2.0";

/// Largest body accepted from a server.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Largest header block tolerated before the buffer is treated as garbage.
const MAX_HEADER_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &[u8] = b"content-length";

fn default_null() -> Value {
    Value::Null
}

/// A request expecting exactly one response.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RequestMessage {
    /// Protocol version, always `"2.0"`.
    pub jsonrpc: String,
    /// Correlation id.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default = "default_null", skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RequestMessage {
    /// Builds a request envelope.
    #[must_use]
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// The answer to a [`RequestMessage`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResponseMessage {
    /// Protocol version, always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request being answered.
    pub id: Option<RequestId>,
    /// Success payload. A JSON `null` result deserializes to `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ResponseMessage {
    /// Builds a successful response. `null` results are written explicitly.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error response.
    #[must_use]
    pub fn failure(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// A one-way message in either direction.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NotificationMessage {
    /// Protocol version, always `"2.0"`.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default = "default_null", skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl NotificationMessage {
    /// Builds a notification envelope.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC request id. Requests issued by this client always use numbers;
/// servers may use strings for their own requests.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id.
    Number(i64),
    /// String id.
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResponseError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Standard JSON-RPC error codes used by this client.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
}

/// A decoded JSON-RPC message, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Carries `id` and `method`; expects a response.
    Request(RequestMessage),
    /// Carries `method` but no `id`.
    Notification(NotificationMessage),
    /// Carries `id` and exactly one of `result` / `error`.
    Response(ResponseMessage),
}

impl Message {
    /// Classifies a decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Unclassifiable`] when the value matches none
    /// of the three shapes, or [`ProtocolError::InvalidEnvelope`] when it
    /// matches a shape but its members have the wrong types.
    pub fn classify(value: Value) -> Result<Self, ProtocolError> {
        let has_id = value.get("id").is_some_and(|id| !id.is_null());
        let has_method = value.get("method").is_some_and(Value::is_string);
        let has_outcome = value.get("result").is_some() || value.get("error").is_some();

        if has_id && has_outcome {
            return serde_json::from_value(value)
                .map(Self::Response)
                .map_err(ProtocolError::InvalidEnvelope);
        }
        if has_method && has_id {
            return serde_json::from_value(value)
                .map(Self::Request)
                .map_err(ProtocolError::InvalidEnvelope);
        }
        if has_method {
            return serde_json::from_value(value)
                .map(Self::Notification)
                .map_err(ProtocolError::InvalidEnvelope);
        }
        Err(ProtocolError::Unclassifiable(value.to_string()))
    }
}

/// Recoverable protocol failures. Logged and dropped, never fatal.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A complete header block without a `Content-Length` line.
    #[error("frame header has no Content-Length")]
    MissingContentLength,
    /// A `Content-Length` value that is not a decimal length.
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    /// A header block that never terminated.
    #[error("header block exceeds {MAX_HEADER_BYTES} bytes without a terminator")]
    HeaderTooLong,
    /// A body larger than [`MAX_FRAME_BYTES`].
    #[error("Content-Length {0} exceeds maximum {MAX_FRAME_BYTES}")]
    FrameTooLarge(usize),
    /// A well-framed body that is not JSON.
    #[error("frame body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    /// JSON that is not a request, notification or response.
    #[error("message is neither request, notification nor response: {0}")]
    Unclassifiable(String),
    /// JSON with the right shape but mistyped members.
    #[error("malformed JSON-RPC envelope: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),
}

/// Serializes a message into a single `Content-Length` frame.
///
/// # Errors
///
/// Returns an error if the message cannot be serialized to JSON.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, serde_json::Error> {
    let body = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    let mut frame = BytesMut::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Incremental decoder for a stream of `Content-Length` frames.
///
/// Bytes that do not yet form a complete frame stay buffered until the next
/// call to [`FrameDecoder::feed`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every message completed by it.
    ///
    /// Framing errors discard the offending bytes up to the next plausible
    /// header; bodies that are not JSON are dropped. Both are logged.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(frame) = self.next_frame() {
            let body = match frame {
                Ok(body) => body,
                Err(e) => {
                    warn!("LSP framing error: {e}");
                    continue;
                }
            };

            match serde_json::from_slice::<Value>(&body) {
                Ok(value) => {
                    trace!("Received LSP message: {}", String::from_utf8_lossy(&body));
                    messages.push(value);
                }
                Err(e) => warn!("{}", ProtocolError::InvalidJson(e)),
            }
        }
        messages
    }

    /// Number of bytes held back waiting for more input.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Extracts the next complete frame body, if any.
    ///
    /// Returns `None` when more input is needed.
    fn next_frame(&mut self) -> Option<Result<Bytes, ProtocolError>> {
        let Some(header_end) = find(&self.buffer, HEADER_TERMINATOR) else {
            if self.buffer.len() > MAX_HEADER_BYTES {
                let len = self.buffer.len();
                self.resync(len);
                return Some(Err(ProtocolError::HeaderTooLong));
            }
            return None;
        };

        let body_start = header_end + HEADER_TERMINATOR.len();
        let content_length = match parse_content_length(&self.buffer[..header_end]) {
            Ok(len) if len > MAX_FRAME_BYTES => {
                self.resync(body_start);
                return Some(Err(ProtocolError::FrameTooLarge(len)));
            }
            Ok(len) => len,
            Err(e) => {
                self.resync(body_start);
                return Some(Err(e));
            }
        };

        if self.buffer.len() < body_start + content_length {
            return None;
        }

        self.buffer.advance(body_start);
        Some(Ok(self.buffer.split_to(content_length).freeze()))
    }

    /// Skips `consumed` bytes, then discards everything before the next
    /// `Content-Length` marker. A trailing partial marker is kept so a header
    /// split across chunks still resynchronizes.
    fn resync(&mut self, consumed: usize) {
        self.buffer.advance(consumed.min(self.buffer.len()));

        if let Some(pos) = find_ignore_case(&self.buffer, CONTENT_LENGTH) {
            self.buffer.advance(pos);
            return;
        }

        let keep = partial_marker_suffix(&self.buffer);
        let drop = self.buffer.len() - keep;
        self.buffer.advance(drop);
    }
}

/// Parses the `Content-Length` header out of a header block.
fn parse_content_length(headers: &[u8]) -> Result<usize, ProtocolError> {
    let headers = std::str::from_utf8(headers)
        .map_err(|_| ProtocolError::InvalidContentLength("<non-utf8 header>".to_string()))?;

    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value
                .parse::<usize>()
                .map_err(|_| ProtocolError::InvalidContentLength(value.to_string()));
        }
    }
    Err(ProtocolError::MissingContentLength)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_ignore_case(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

/// Length of the longest buffer suffix that could begin a `Content-Length`
/// marker.
fn partial_marker_suffix(buffer: &[u8]) -> usize {
    let max = buffer.len().min(CONTENT_LENGTH.len() - 1);
    (1..=max)
        .rev()
        .find(|&n| buffer[buffer.len() - n..].eq_ignore_ascii_case(&CONTENT_LENGTH[..n]))
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    reason = "Tests use expect/unwrap/panic for clear failure messages"
)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    fn feed_all(chunks: &[&[u8]]) -> Vec<Value> {
        let mut decoder = FrameDecoder::new();
        chunks.iter().flat_map(|c| decoder.feed(c)).collect()
    }

    #[test]
    fn test_empty_object_frame() {
        let mut decoder = FrameDecoder::new();
        let messages = decoder.feed(b"Content-Length: 2\r\n\r\n{}");
        assert_eq!(messages, vec![json!({})]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_header_split_across_chunks() {
        let messages = feed_all(&[b"Content-Length: 2\r\n\r", b"\n{}"]);
        assert_eq!(messages, vec![json!({})]);
    }

    #[test]
    fn test_incomplete_header_is_retained() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"Content-Length: 10\r\n").is_empty());
        assert_eq!(decoder.buffered(), 20);
    }

    #[test]
    fn test_incomplete_body_is_retained() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"Content-Length: 100\r\n\r\n{\"partial\":").is_empty());
        assert!(decoder.buffered() > 0);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut raw = frame(r#"{"jsonrpc":"2.0","id":1,"result":null}"#);
        raw.extend(frame(r#"{"jsonrpc":"2.0","method":"initialized"}"#));

        let messages = feed_all(&[&raw]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["id"], 1);
        assert_eq!(messages[1]["method"], "initialized");
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let mut raw = frame(r#"{"jsonrpc":"2.0","id":1,"result":{"items":[]}}"#);
        raw.extend(frame(r#"{"jsonrpc":"2.0","method":"window/logMessage","params":{"type":3,"message":"héllo ✓"}}"#));
        raw.extend(frame(r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32603,"message":"boom"}}"#));

        let whole = feed_all(&[&raw]);
        assert_eq!(whole.len(), 3);

        for split in 0..=raw.len() {
            let (a, b) = raw.split_at(split);
            assert_eq!(feed_all(&[a, b]), whole, "split at {split}");
        }

        let bytes: Vec<&[u8]> = raw.chunks(1).collect();
        assert_eq!(feed_all(&bytes), whole);
    }

    #[test]
    fn test_case_insensitive_header_and_extra_headers() {
        let body = r#"{"test":true}"#;
        let raw = format!(
            "content-length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{body}",
            body.len()
        );
        assert_eq!(feed_all(&[raw.as_bytes()]), vec![json!({"test": true})]);
    }

    #[test]
    fn test_missing_content_length_resyncs_on_next_header() {
        let mut raw = b"Content-Type: text/plain\r\n\r\ngarbage".to_vec();
        raw.extend(frame(r#"{"ok":1}"#));

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&raw), vec![json!({"ok": 1})]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_unparsable_content_length_resyncs_across_chunks() {
        let good = frame(r#"{"ok":2}"#);
        let mut raw = b"Content-Length: abc\r\n\r\n".to_vec();
        raw.extend(&good);

        // Break inside the marker of the good frame.
        let (a, b) = raw.split_at(26);
        assert_eq!(feed_all(&[a, b]), vec![json!({"ok": 2})]);
    }

    #[test]
    fn test_invalid_json_body_is_dropped() {
        let mut raw = frame("{not json}");
        raw.extend(frame(r#"{"after":true}"#));
        assert_eq!(feed_all(&[&raw]), vec![json!({"after": true})]);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut raw = header.into_bytes();
        raw.extend(frame(r#"{"ok":3}"#));
        assert_eq!(feed_all(&[&raw]), vec![json!({"ok": 3})]);
    }

    #[test]
    fn test_runaway_header_is_discarded() {
        let mut decoder = FrameDecoder::new();
        let junk = vec![b'x'; MAX_HEADER_BYTES + 1];
        assert!(decoder.feed(&junk).is_empty());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_encode_is_exact() {
        let notification = NotificationMessage::new("initialized", json!({}));
        let bytes = encode(&notification).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();

        let body = r#"{"jsonrpc":"2.0","method":"initialized","params":{}}"#;
        assert_eq!(text, format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    }

    #[test]
    fn test_encode_counts_bytes_not_chars() {
        let notification = NotificationMessage::new("x", json!({ "s": "ünïcødé" }));
        let bytes = encode(&notification).unwrap();
        let mut decoder = FrameDecoder::new();
        let decoded = decoder.feed(&bytes);
        assert_eq!(decoded, vec![serde_json::to_value(&notification).unwrap()]);
    }

    #[test]
    fn test_encode_then_feed_round_trips_each_shape() {
        let request = RequestMessage::new(7, "textDocument/hover", json!({ "a": 1 }));
        let response = ResponseMessage::failure(RequestId::Number(7), -32601, "nope");
        let notification = NotificationMessage::new("exit", Value::Null);

        let mut decoder = FrameDecoder::new();
        let mut stream = encode(&request).unwrap().to_vec();
        stream.extend_from_slice(&encode(&response).unwrap());
        stream.extend_from_slice(&encode(&notification).unwrap());

        let messages: Vec<Message> = decoder
            .feed(&stream)
            .into_iter()
            .map(|v| Message::classify(v).unwrap())
            .collect();

        assert_eq!(
            messages,
            vec![
                Message::Request(request),
                Message::Response(response),
                Message::Notification(notification),
            ]
        );
    }

    #[test]
    fn test_classify_response_with_null_result() {
        let msg = Message::classify(json!({"jsonrpc":"2.0","id":1,"result":null})).unwrap();
        let Message::Response(response) = msg else {
            panic!("expected response");
        };
        assert_eq!(response.id, Some(RequestId::Number(1)));
        assert!(response.result.is_none());
        assert!(response.error.is_none());
    }

    #[test]
    fn test_classify_response_with_error() {
        let msg = Message::classify(
            json!({"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"Invalid Request"}}),
        )
        .unwrap();
        let Message::Response(response) = msg else {
            panic!("expected response");
        };
        assert_eq!(response.error.map(|e| e.code), Some(-32600));
    }

    #[test]
    fn test_classify_server_request_with_string_id() {
        let msg = Message::classify(
            json!({"jsonrpc":"2.0","id":"abc-123","method":"workspace/configuration","params":{}}),
        )
        .unwrap();
        assert!(matches!(
            msg,
            Message::Request(RequestMessage { id: RequestId::String(ref s), .. }) if s == "abc-123"
        ));
    }

    #[test]
    fn test_classify_notification_without_params() {
        let msg = Message::classify(json!({"jsonrpc":"2.0","method":"initialized"})).unwrap();
        assert!(matches!(msg, Message::Notification(ref n) if n.params.is_null()));
    }

    #[test]
    fn test_classify_rejects_shapeless_values() {
        assert!(matches!(
            Message::classify(json!({})),
            Err(ProtocolError::Unclassifiable(_))
        ));
        assert!(matches!(
            Message::classify(json!({"jsonrpc":"2.0","id":4})),
            Err(ProtocolError::Unclassifiable(_))
        ));
    }

    #[test]
    fn test_null_params_are_omitted() {
        let request = RequestMessage::new(1, "shutdown", Value::Null);
        let text = serde_json::to_string(&request).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","id":1,"method":"shutdown"}"#);
    }
}
