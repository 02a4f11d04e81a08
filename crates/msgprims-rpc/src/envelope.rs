use std::fmt;

use bytes::Bytes;
use msgprims_core::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const TYPE_REQUEST: &str = "request";
pub const TYPE_RESPONSE: &str = "response";
pub const TYPE_ERROR: &str = "error";

/// Machine-readable reason carried by `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No object is registered under the requested target.
    UnknownTarget,
    /// The target exists but has no such method.
    UnknownMethod,
    /// The request lacks a method or target, or has non-object params.
    MalformedRequest,
    /// The method ran and failed (or panicked).
    InvocationFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnknownTarget => "unknown_target",
            ErrorCode::UnknownMethod => "unknown_method",
            ErrorCode::MalformedRequest => "malformed_request",
            ErrorCode::InvocationFailed => "invocation_failed",
        }
    }

    /// Parse a wire code. Unrecognized codes map to `InvocationFailed`.
    pub fn from_wire(code: Option<&str>) -> Self {
        match code {
            Some("unknown_target") => ErrorCode::UnknownTarget,
            Some("unknown_method") => ErrorCode::UnknownMethod,
            Some("malformed_request") => ErrorCode::MalformedRequest,
            _ => ErrorCode::InvocationFailed,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RPC envelope, carried in a message's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Request {
        id: u64,
        target: String,
        method: String,
        #[serde(default = "empty_object")]
        params: Value,
    },
    Response {
        id: u64,
        #[serde(default = "empty_object")]
        result: Value,
    },
    Error {
        id: u64,
        code: ErrorCode,
        error: String,
    },
}

impl Envelope {
    pub fn id(&self) -> u64 {
        match self {
            Envelope::Request { id, .. } | Envelope::Response { id, .. } | Envelope::Error { id, .. } => {
                *id
            }
        }
    }

    pub fn error(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Envelope::Error {
            id,
            code,
            error: message.into(),
        }
    }

    /// Serialize into a message carrying `blobs`.
    pub fn into_message(self, blobs: Vec<Bytes>) -> serde_json::Result<Message> {
        Ok(Message {
            text: serde_json::to_value(self)?,
            blobs,
        })
    }
}

pub(crate) fn empty_object() -> Value {
    Value::Object(Map::new())
}
