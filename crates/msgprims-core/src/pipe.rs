use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::MessageBus;
use crate::connection::{Connection, SharedConnection};
use crate::error::{ConnectionError, Result};
use crate::handler::{Listener, ListenerToken};
use crate::message::{ChannelEvent, Message};

/// A connection assembled from an ingress and an egress side.
///
/// Listener registration goes to `ingress`; `send` and `close` go to `egress`.
pub struct SimpleConnection {
    ingress: SharedConnection,
    egress: SharedConnection,
}

impl SimpleConnection {
    pub fn new(ingress: SharedConnection, egress: SharedConnection) -> Self {
        Self { ingress, egress }
    }

    pub fn ingress(&self) -> &SharedConnection {
        &self.ingress
    }

    pub fn egress(&self) -> &SharedConnection {
        &self.egress
    }
}

#[async_trait]
impl Connection for SimpleConnection {
    fn register_message_handler(&self, listener: Listener<ChannelEvent>) -> Option<ListenerToken> {
        self.ingress.register_message_handler(listener)
    }

    fn unregister_message_handler(&self, token: ListenerToken) {
        self.ingress.unregister_message_handler(token);
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.egress.send(message).await
    }

    async fn close(&self) -> Result<()> {
        self.egress.close().await
    }
}

/// Two connected in-process endpoints with synchronous delivery.
///
/// Listeners run on the sender's task during `send()`. Mostly useful in tests;
/// a listener that sends back on the same pipe re-enters the sender.
pub fn inline_pipe() -> (SharedConnection, SharedConnection) {
    let first_bus: SharedConnection = Arc::new(MessageBus::new());
    let second_bus: SharedConnection = Arc::new(MessageBus::new());

    let first = SimpleConnection::new(first_bus.clone(), second_bus.clone());
    let second = SimpleConnection::new(second_bus, first_bus);
    (Arc::new(first), Arc::new(second))
}

/// Two connected in-process endpoints with decoupled delivery.
///
/// See [`DecoupledConnection`].
pub fn pipe() -> (SharedConnection, SharedConnection) {
    let (first, second) = inline_pipe();
    (
        Arc::new(DecoupledConnection::new(first)),
        Arc::new(DecoupledConnection::new(second)),
    )
}

enum Operation {
    Send(Message),
    Close,
}

/// Fire-and-forget wrapper around another connection.
///
/// `send` and `close` enqueue the operation and return at once. One worker task
/// per wrapper drains the queue in FIFO order on the Tokio runtime; failures of
/// the wrapped connection are logged and never reach the caller.
pub struct DecoupledConnection {
    inner: SharedConnection,
    queue: mpsc::UnboundedSender<Operation>,
    pending_worker: Mutex<Option<mpsc::UnboundedReceiver<Operation>>>,
}

impl DecoupledConnection {
    pub fn new(inner: SharedConnection) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        Self {
            inner,
            queue,
            pending_worker: Mutex::new(Some(receiver)),
        }
    }

    fn enqueue(&self, operation: Operation) -> Result<()> {
        {
            let mut worker = self
                .pending_worker
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if worker.is_some() {
                let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
                    ConnectionError::Transport("no Tokio runtime to run the pipe worker".to_string())
                })?;
                if let Some(receiver) = worker.take() {
                    runtime.spawn(run_worker(self.inner.clone(), receiver));
                }
            }
        }

        self.queue
            .send(operation)
            .map_err(|_| ConnectionError::Transport("decoupled worker stopped".to_string()))
    }
}

async fn run_worker(inner: SharedConnection, mut receiver: mpsc::UnboundedReceiver<Operation>) {
    while let Some(operation) = receiver.recv().await {
        match operation {
            Operation::Send(message) => {
                if let Err(err) = inner.send(message).await {
                    tracing::error!(error = %err, "decoupled send failed");
                }
            }
            Operation::Close => {
                if let Err(err) = inner.close().await {
                    tracing::error!(error = %err, "decoupled close failed");
                }
            }
        }
    }
}

#[async_trait]
impl Connection for DecoupledConnection {
    fn register_message_handler(&self, listener: Listener<ChannelEvent>) -> Option<ListenerToken> {
        self.inner.register_message_handler(listener)
    }

    fn unregister_message_handler(&self, token: ListenerToken) {
        self.inner.unregister_message_handler(token);
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.enqueue(Operation::Send(message))
    }

    async fn close(&self) -> Result<()> {
        self.enqueue(Operation::Close)
    }
}
