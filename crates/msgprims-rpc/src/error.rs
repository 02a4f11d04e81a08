use std::time::Duration;

use msgprims_core::ConnectionError;

use crate::envelope::ErrorCode;

/// Errors that can occur while making or serving remote calls.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The underlying connection failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The remote side answered with an error envelope.
    #[error("remote call failed ({code}): {message}")]
    Remote { code: ErrorCode, message: String },

    /// No response arrived within the timeout. The remote call is abandoned.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The connection closed before a response arrived.
    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    /// The proxy type was never declared on this client.
    #[error("unknown proxy type: {0}")]
    UnknownType(String),

    /// The method is not part of the proxy's declared method list.
    #[error("method '{method}' is not declared on '{type_name}'")]
    UndeclaredMethod { type_name: String, method: String },

    /// A declared method list contained an empty or duplicate name.
    #[error("invalid method name: '{0}'")]
    InvalidMethodName(String),

    /// An envelope could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// The remote error code, if this is a remote error.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            RpcError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
