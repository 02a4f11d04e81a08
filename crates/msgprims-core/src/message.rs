use bytes::Bytes;
use serde_json::{Map, Value};

/// A structured value plus an ordered list of binary buffers.
///
/// `text` and `blobs` always travel together. Applications refer to blobs by
/// their index, so transports must preserve blob order.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The JSON part of the message.
    pub text: Value,
    /// Binary attachments, in application order.
    pub blobs: Vec<Bytes>,
}

impl Message {
    /// Create a message without blobs.
    pub fn new(text: Value) -> Self {
        Self {
            text,
            blobs: Vec::new(),
        }
    }

    /// Create a message with blobs.
    pub fn with_blobs<I, B>(text: Value, blobs: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            text,
            blobs: blobs.into_iter().map(Into::into).collect(),
        }
    }

    /// A message carrying an empty JSON object and no blobs.
    pub fn empty() -> Self {
        Self::new(Value::Object(Map::new()))
    }

    /// The text as a JSON object, if it is one.
    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.text.as_object()
    }

    /// Look up a top-level field of an object-valued text.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.text.get(key)
    }

    /// Look up a top-level string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Value> for Message {
    fn from(text: Value) -> Self {
        Self::new(text)
    }
}

/// What a connection delivers to its listeners.
///
/// `Closed` is the end-of-channel notification. It can never be sent as data.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Data(Message),
    Closed,
}

impl ChannelEvent {
    pub fn is_closed(&self) -> bool {
        matches!(self, ChannelEvent::Closed)
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            ChannelEvent::Data(message) => Some(message),
            ChannelEvent::Closed => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            ChannelEvent::Data(message) => Some(message),
            ChannelEvent::Closed => None,
        }
    }
}
