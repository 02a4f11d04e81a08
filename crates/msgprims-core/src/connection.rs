use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BoxError, Result};
use crate::handler::{Listener, ListenerToken, Reaction};
use crate::message::{ChannelEvent, Message};

/// A bidirectional message channel.
///
/// Lifecycle is OPEN → CLOSED, one-way. Every listener registered at close
/// time receives [`ChannelEvent::Closed`] at most once; a listener registered
/// after close receives it immediately and no token is returned. Sending on a
/// closed connection fails with [`ConnectionError::Closed`](crate::ConnectionError::Closed).
#[async_trait]
pub trait Connection: Send + Sync {
    /// Register a listener for inbound events.
    fn register_message_handler(&self, listener: Listener<ChannelEvent>) -> Option<ListenerToken>;

    /// Remove a previously registered listener.
    fn unregister_message_handler(&self, token: ListenerToken);

    /// Send a message to the other side.
    async fn send(&self, message: Message) -> Result<()>;

    /// Close the sending side. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Reference-counted, type-erased connection.
pub type SharedConnection = Arc<dyn Connection>;

/// Closure-friendly registration helpers for any [`Connection`].
pub trait ConnectionExt: Connection {
    /// Register a synchronous listener.
    fn on_event<F>(&self, listener: F) -> Option<ListenerToken>
    where
        F: Fn(ChannelEvent) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.register_message_handler(Arc::new(move |ev| Reaction::Ready(listener(ev))))
    }

    /// Register an asynchronous listener.
    fn on_event_async<F, Fut>(&self, listener: F) -> Option<ListenerToken>
    where
        F: Fn(ChannelEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.register_message_handler(Arc::new(move |ev| Reaction::pending(listener(ev))))
    }
}

impl<C: Connection + ?Sized> ConnectionExt for C {}
