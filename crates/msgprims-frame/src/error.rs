/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame declares zero parts; the text part is mandatory.
    #[error("frame has no text part")]
    EmptyFrame,

    /// The frame declares more parts than allowed.
    #[error("too many frame parts ({count}, max {max})")]
    TooManyParts { count: usize, max: usize },

    /// The frame exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The text part is not valid JSON.
    #[error("invalid message text: {0}")]
    InvalidText(#[from] serde_json::Error),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
