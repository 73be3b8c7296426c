//! Line-delimited JSON-RPC framing.
//!
//! Every message is one JSON object followed by `\n`. Decoding never
//! panics: anything that is not a response, request or notification comes
//! back as a [`ParseError`], which the connection treats as a transient
//! channel error.

use bytes::BytesMut;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::Decoder;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

/// Tool output handed to the model is cut off after this many bytes (1MB).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Largest inbound message read into memory (16MB). Longer lines are
/// skipped as they stream past.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Bytes kept from the start of an oversized line, enough to find its id.
const HEAD_SIZE: usize = 256;

/// Errors produced while decoding an inbound line.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,

    #[error("line too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object")]
    NotAnObject,

    #[error("unrecognized message: {0}")]
    Unrecognized(String),
}

/// A message written to the server.
#[derive(Debug, Clone)]
pub enum Outbound {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

/// A message read from the server.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Answer to one of our requests.
    Response(JsonRpcResponse),
    /// Server-initiated request expecting an answer.
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    /// Fire-and-forget message (log lines, progress, list changes).
    Notification { method: String, params: Option<Value> },
}

/// Encode a message as a single newline-terminated line.
pub fn encode(message: &Outbound) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = match message {
        Outbound::Request(req) => serde_json::to_vec(req)?,
        Outbound::Notification(note) => serde_json::to_vec(note)?,
        Outbound::Response(resp) => serde_json::to_vec(resp)?,
    };
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one line received from the server.
pub fn decode(line: &[u8]) -> Result<Inbound, ParseError> {
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(ParseError::TooLarge {
            size: line.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    if line.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }

    let value: Value = serde_json::from_slice(line)?;
    let Value::Object(mut object) = value else {
        return Err(ParseError::NotAnObject);
    };

    let method = match object.remove("method") {
        Some(Value::String(method)) => Some(method),
        Some(other) => {
            return Err(ParseError::Unrecognized(format!(
                "method must be a string, got {other}"
            )));
        }
        None => None,
    };

    match (method, object.contains_key("id")) {
        (Some(method), true) => {
            let id: RequestId = serde_json::from_value(object.remove("id").unwrap_or_default())?;
            Ok(Inbound::Request {
                id,
                method,
                params: object.remove("params"),
            })
        }
        (Some(method), false) => Ok(Inbound::Notification {
            method,
            params: object.remove("params"),
        }),
        (None, true) if object.contains_key("result") || object.contains_key("error") => {
            let response: JsonRpcResponse = serde_json::from_value(Value::Object(object))?;
            Ok(Inbound::Response(response))
        }
        (None, _) => Err(ParseError::Unrecognized(
            "neither a request, a response nor a notification".to_string(),
        )),
    }
}

/// Id of a message too large to decode, read from its first bytes.
///
/// Servers write `id` before the payload, so the head usually has it.
pub fn peek_id(head: &[u8]) -> Option<RequestId> {
    let text = String::from_utf8_lossy(head);
    let start = text.find("\"id\"")? + 4;
    let value = text[start..].trim_start().strip_prefix(':')?.trim_start();
    if let Some(quoted) = value.strip_prefix('"') {
        let end = quoted.find('"')?;
        return Some(RequestId::Text(quoted[..end].to_string()));
    }
    let digits: String = value
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    digits.parse().ok().map(RequestId::Number)
}

/// One unit cut from the inbound byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, without `\n` or `\r\n`.
    Line(Vec<u8>),
    /// A line over the size limit. Only its first bytes were kept.
    Oversized { head: Vec<u8>, size: usize },
}

/// Splits a byte stream at `\n` without looking at the bytes, so invalid
/// UTF-8 reaches [`decode`] as an ordinary bad line.
///
/// Never fails on content: an oversized line is dropped while it streams
/// past and reported as [`Frame::Oversized`].
#[derive(Debug)]
pub struct LineFramer {
    max: usize,
    scanned: usize,
    skipping: Option<(Vec<u8>, usize)>,
}

impl LineFramer {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            scanned: 0,
            skipping: None,
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

fn head_of(bytes: &[u8]) -> Vec<u8> {
    bytes[..bytes.len().min(HEAD_SIZE)].to_vec()
}

impl Decoder for LineFramer {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        let newline = buf[self.scanned..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| self.scanned + offset);

        let Some(end) = newline else {
            if self.skipping.is_none() && buf.len() <= self.max {
                self.scanned = buf.len();
                return Ok(None);
            }
            let (_, size) = self.skipping.get_or_insert_with(|| (head_of(&buf[..]), 0));
            *size += buf.len();
            buf.clear();
            self.scanned = 0;
            return Ok(None);
        };

        self.scanned = 0;
        let mut line = buf.split_to(end + 1);
        line.truncate(end);
        if line.last() == Some(&b'\r') {
            line.truncate(end - 1);
        }

        let frame = match self.skipping.take() {
            Some((head, size)) => Frame::Oversized {
                head,
                size: size + line.len(),
            },
            None if line.len() > self.max => Frame::Oversized {
                head: head_of(&line),
                size: line.len(),
            },
            None => Frame::Line(line.to_vec()),
        };
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        // Final line without a terminator.
        self.scanned = 0;
        let rest = buf.split();
        match self.skipping.take() {
            Some((head, size)) => Ok(Some(Frame::Oversized {
                head,
                size: size + rest.len(),
            })),
            None if rest.is_empty() => Ok(None),
            None => Ok(Some(Frame::Line(rest.to_vec()))),
        }
    }
}
