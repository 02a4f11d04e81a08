use msgprims_rpc::RpcError;

/// Errors that can occur while talking to a remote manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// A manager call failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The remote manager answered the handshake with another version.
    #[error("remote endpoint has an unsupported version: {0}")]
    UnsupportedVersion(u64),

    /// A manager reply did not have the expected shape.
    #[error("malformed manager reply: {0}")]
    MalformedReply(String),
}

pub type Result<T> = std::result::Result<T, ManagerError>;
