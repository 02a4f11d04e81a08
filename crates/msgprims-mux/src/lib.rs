//! Many independently closable virtual connections over one physical
//! [`Connection`](msgprims_core::Connection).
//!
//! Every stream has a name. Outbound messages are wrapped as
//! `{type: "message", target: <name>, payload: <text>}` with their blobs
//! unchanged; the peer unwraps them into the stream of the same name.
//! Closing a stream sends `{type: "close", target}`. Messages for a name the
//! receiver never registered are answered with a single `close`.

pub mod envelope;
pub mod error;
pub mod multiplexer;

pub use error::{MuxError, Result};
pub use multiplexer::Multiplexer;
