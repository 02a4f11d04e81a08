//! Transport-agnostic messaging substrate.
//!
//! Everything in msgprims is built on the [`Connection`] contract defined here:
//! a bidirectional channel that carries [`Message`]s (a JSON value plus an
//! ordered list of binary blobs) and announces its end with a single
//! [`ChannelEvent::Closed`].
//!
//! This crate also provides:
//! - [`Handler`]: a multi-listener event dispatcher with per-listener failure isolation
//! - [`MessageBus`]: a loopback Connection backed by one `Handler`
//! - [`SimpleConnection`], [`inline_pipe`] and [`pipe`]: in-process wiring

pub mod bus;
pub mod connection;
pub mod error;
pub mod handler;
pub mod message;
pub mod pipe;

pub use bus::MessageBus;
pub use connection::{Connection, ConnectionExt, SharedConnection};
pub use error::{panic_message, AggregateError, BoxError, ConnectionError, ListenerPanicked, Result};
pub use handler::{Handler, Invoked, Listener, ListenerToken, Reaction};
pub use message::{ChannelEvent, Message};
pub use pipe::{inline_pipe, pipe, DecoupledConnection, SimpleConnection};
