//! Wire-level building blocks for the Chrome DevTools Protocol.
//!
//! Everything in this crate is pure data plus (de)serialization: the outbound
//! command envelope, classification of inbound text into replies and events,
//! and the `Method`/`Command` traits that every typed command implements so a
//! single invoke path can carry the whole generated command family.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identifier correlating a command with its reply.
///
/// Allocated once per call from a session-wide monotonic counter and never
/// reused for the lifetime of that session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failures raised while encoding or classifying wire text.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message id is not an unsigned integer")]
    InvalidId,
    #[error("message carries neither an id nor a method")]
    UnknownShape,
}

/// Outbound command envelope: `{"id": .., "method": "..", "params": {..}}`.
///
/// Immutable once built; one envelope is constructed per call.
#[derive(Clone, Debug, Serialize)]
pub struct Envelope {
    pub id: CallId,
    pub method: String,
    pub params: Value,
}

impl Envelope {
    pub fn new(id: CallId, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Serialize to the text frame sent over the transport.
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Error object carried by a failure reply.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProtocolError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Reply to a single command. Success iff `result` is populated, failure iff
/// `error` is; the remote never sends both.
#[derive(Clone, Debug)]
pub struct Response {
    pub id: CallId,
    pub result: Option<Value>,
    pub error: Option<ProtocolError>,
}

impl Response {
    /// Collapse into the payload a pending call resolves with. A reply with
    /// neither field counts as a success with an empty result.
    pub fn into_outcome(self) -> Result<Value, ProtocolError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Unsolicited server-initiated message.
#[derive(Clone, Debug)]
pub struct EventMessage {
    pub method: String,
    pub params: Value,
}

/// One inbound wire message, classified.
#[derive(Clone, Debug)]
pub enum Message {
    Response(Response),
    Event(EventMessage),
}

/// Classify one inbound text frame.
///
/// A message carrying an `id` field is a reply; a message without `id` is an
/// event identified by its `method` field. Anything else is malformed.
pub fn parse_message(text: &str) -> Result<Message, CodecError> {
    let value: Value = serde_json::from_str(text)?;

    if let Some(raw_id) = value.get("id") {
        let id = raw_id.as_u64().ok_or(CodecError::InvalidId)?;
        let error = match value.get("error") {
            Some(err) => Some(serde_json::from_value(err.clone())?),
            None => None,
        };
        return Ok(Message::Response(Response {
            id: CallId(id),
            result: value.get("result").cloned(),
            error,
        }));
    }

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        return Ok(Message::Event(EventMessage {
            method: method.to_string(),
            params: value.get("params").cloned().unwrap_or(Value::Null),
        }));
    }

    Err(CodecError::UnknownShape)
}

/// A typed result stamped with the id of the command that produced it.
#[derive(Clone, Debug)]
pub struct CommandResponse<T> {
    pub id: CallId,
    pub method: String,
    pub result: T,
}

/// Anything addressable by a protocol method name.
pub trait Method {
    /// Qualified name, e.g. `Page.navigate`.
    fn method_name(&self) -> &'static str;
}

/// A command value that can ride the single invoke path: its serialized form
/// is the `params` object, `Response` is the decoded shape of a success
/// reply, and `validate` runs before any network activity.
pub trait Command: Method + Serialize + Send + Sync {
    type Response: DeserializeOwned + Send + 'static;

    /// Check required fields and constrained ranges. The default accepts
    /// everything; commands with constraints override it.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Escape a string for embedding inside a hand-assembled JSON fragment.
///
/// Backslashes must be doubled before quotes are escaped, otherwise the
/// escape characters themselves get re-escaped.
pub fn escape_text(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}
