use std::any::Any;
use std::fmt;

/// Boxed error type produced by listeners and RPC handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur on a [`Connection`](crate::Connection).
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connection was closed before the operation.
    #[error("connection closed")]
    Closed,

    /// One or more listeners failed while a message was delivered.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// An I/O error occurred on the underlying stream.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The underlying transport reported a failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ConnectionError {
    /// Returns true if this error only reports that the connection is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionError::Closed)
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

/// All failures collected from the listeners of a single `emit`.
///
/// Synchronous failures come first in call order, followed by asynchronous
/// failures in the order they settled.
#[derive(Debug)]
pub struct AggregateError {
    errors: Vec<BoxError>,
}

impl AggregateError {
    pub fn new(errors: Vec<BoxError>) -> Self {
        Self { errors }
    }

    /// The collected listener errors.
    pub fn errors(&self) -> &[BoxError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<BoxError> {
        self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} listener(s) failed:", self.errors.len())?;
        for (index, err) in self.errors.iter().enumerate() {
            write!(f, "\n  [{index}] {err}")?;
            let mut source = err.source();
            while let Some(cause) = source {
                write!(f, "\n      caused by: {cause}")?;
                source = cause.source();
            }
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// A listener or handler panicked instead of returning.
#[derive(Debug, thiserror::Error)]
#[error("panicked: {0}")]
pub struct ListenerPanicked(pub String);

/// Extract a readable message from a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn aggregate_display_lists_every_error_with_causes() {
        let errors: Vec<BoxError> = vec![
            "first".into(),
            Box::new(Outer(std::io::Error::other("inner"))),
        ];
        let aggregate = AggregateError::new(errors);

        let text = aggregate.to_string();
        assert!(text.starts_with("2 listener(s) failed:"));
        assert!(text.contains("[0] first"));
        assert!(text.contains("[1] outer"));
        assert!(text.contains("caused by: inner"));
    }

    #[test]
    fn panic_message_handles_str_and_string() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "<non-string panic payload>");
    }
}
