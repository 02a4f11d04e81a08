use msgprims_core::Message;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Well-known RPC target of every manager.
pub const MANAGER_ID: &str = "a6eb965e-1c6a-4c23-897f-99ef0b9fb762";
/// Proxy type name the remote side declares for the manager.
pub const MANAGER_TYPE: &str = "remote_manager";

pub const METHOD_VERSION: &str = "version";
pub const METHOD_HAS_SERVICE: &str = "has_service";
pub const METHOD_ACQUIRE_OBJECT: &str = "acquire_object";
pub const METHOD_RELEASE_OBJECT: &str = "release_object";

/// Every manager method, in declaration order.
pub const MANAGER_METHODS: [&str; 4] = [
    METHOD_VERSION,
    METHOD_HAS_SERVICE,
    METHOD_ACQUIRE_OBJECT,
    METHOD_RELEASE_OBJECT,
];

/// The only protocol version spoken.
pub const PROTOCOL_VERSION: u64 = 1;

/// A protocol version with its extensions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: u64,
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            extensions: Vec::new(),
        }
    }
}

/// `version` request: the versions the caller can speak.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported: Option<Vec<VersionInfo>>,
}

/// `has_service` / `acquire_object` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRequest {
    pub service: String,
}

/// `has_service` reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExistsReply {
    pub exists: bool,
}

/// `acquire_object` reply. `id` is present when `exists` is true.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcquireReply {
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// `release_object` request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub obj: String,
}

/// `release_object` reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseReply {
    pub removed: bool,
}

pub(crate) fn to_message<T: Serialize>(value: &T) -> serde_json::Result<Message> {
    Ok(Message::new(serde_json::to_value(value)?))
}

pub(crate) fn from_message<T: DeserializeOwned>(message: &Message) -> serde_json::Result<T> {
    T::deserialize(&message.text)
}
