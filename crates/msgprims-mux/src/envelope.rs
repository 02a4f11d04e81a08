use msgprims_core::Message;
use serde_json::{json, Value};

pub const TYPE_MESSAGE: &str = "message";
pub const TYPE_CLOSE: &str = "close";
pub const TYPE_ILLEGAL: &str = "illegal";

/// Wrap a stream message for the physical connection.
pub fn wrap(target: &str, message: Message) -> Message {
    Message {
        text: json!({"type": TYPE_MESSAGE, "target": target, "payload": message.text}),
        blobs: message.blobs,
    }
}

/// A control envelope (`close` or `illegal`) with an empty payload.
pub fn control(kind: &str, target: impl Into<Value>) -> Message {
    Message::new(json!({"type": kind, "target": target.into(), "payload": {}}))
}

/// True if the envelope's type counts as "message". A missing type does.
pub fn is_message(text: &Value) -> bool {
    match text.get("type") {
        None | Some(Value::Null) => true,
        Some(kind) => kind.as_str() == Some(TYPE_MESSAGE),
    }
}
