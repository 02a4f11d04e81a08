use msgprims_core::ConnectionError;

/// Errors that can occur on a [`Multiplexer`](crate::Multiplexer).
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The physical connection failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The multiplexer was closed; no new streams can be registered.
    #[error("multiplexer closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, MuxError>;
