use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::future::join_all;
use msgprims_core::{
    BoxError, ChannelEvent, Connection, ConnectionError, Listener, ListenerToken, Message,
    MessageBus, Reaction, SharedConnection, SimpleConnection,
};
use serde_json::Value;

use crate::envelope::{control, is_message, wrap, TYPE_CLOSE, TYPE_ILLEGAL, TYPE_MESSAGE};
use crate::error::{MuxError, Result};

/// Splits one physical connection into named virtual streams.
///
/// Cloning is cheap; clones share the same stream table.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    connection: SharedConnection,
    state: Mutex<MuxState>,
    control_token: Mutex<Option<ListenerToken>>,
    next_stream: AtomicU64,
}

#[derive(Default)]
struct MuxState {
    streams: HashMap<String, StreamEntry>,
    closed: bool,
}

struct StreamEntry {
    id: u64,
    connection: Arc<SimpleConnection>,
    filter: Option<ListenerToken>,
}

type TokenSlot = Arc<Mutex<Option<ListenerToken>>>;

impl Multiplexer {
    /// Start multiplexing on `connection`.
    pub fn new(connection: SharedConnection) -> Self {
        let inner = Arc::new(MuxInner {
            connection: connection.clone(),
            state: Mutex::new(MuxState::default()),
            control_token: Mutex::new(None),
            next_stream: AtomicU64::new(0),
        });

        let token = connection.register_message_handler(control_listener(Arc::downgrade(&inner)));
        *lock(&inner.control_token) = token;

        Self { inner }
    }

    /// The stream called `name`, created on first use.
    ///
    /// Registering a name that is already open returns the same stream.
    pub fn register(&self, name: &str) -> Result<Arc<SimpleConnection>> {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return Err(MuxError::Closed);
        }
        if let Some(entry) = state.streams.get(name) {
            return Ok(entry.connection.clone());
        }

        let id = self.inner.next_stream.fetch_add(1, Ordering::Relaxed);
        let ingress = Arc::new(MessageBus::new());
        let egress = Arc::new(MessageBus::new());
        let egress_token: TokenSlot = Arc::new(Mutex::new(None));

        let stream = Stream {
            mux: Arc::downgrade(&self.inner),
            name: name.to_string(),
            id,
            ingress: ingress.clone(),
            egress: egress.clone(),
            egress_token: egress_token.clone(),
        };

        let egress_listener = stream.egress_listener();
        *lock(&egress_token) = egress.register_message_handler(egress_listener);

        let connection = Arc::new(SimpleConnection::new(ingress, egress));
        state.streams.insert(
            name.to_string(),
            StreamEntry {
                id,
                connection: connection.clone(),
                filter: None,
            },
        );
        drop(state);

        // A closed physical connection calls the filter at once, so the table
        // lock must be released first.
        let filter = self
            .inner
            .connection
            .register_message_handler(stream.filter_listener());
        let orphaned = {
            let mut state = lock(&self.inner.state);
            match state.streams.get_mut(name) {
                Some(entry) if entry.id == id => {
                    entry.filter = filter;
                    None
                }
                _ => filter,
            }
        };
        if let Some(token) = orphaned {
            self.inner.connection.unregister_message_handler(token);
        }

        tracing::debug!(stream = name, "registered multiplexed stream");
        Ok(connection)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        lock(&self.inner.state).streams.contains_key(name)
    }

    /// Names of the currently open streams.
    pub fn stream_names(&self) -> Vec<String> {
        lock(&self.inner.state).streams.keys().cloned().collect()
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.inner.connection
    }

    /// Close every stream, then the physical connection.
    ///
    /// Stream close failures are logged and do not stop the others.
    pub async fn close(&self) -> Result<()> {
        let streams: Vec<(String, Arc<SimpleConnection>)> = {
            let mut state = lock(&self.inner.state);
            state.closed = true;
            state
                .streams
                .iter()
                .map(|(name, entry)| (name.clone(), entry.connection.clone()))
                .collect()
        };

        let results = join_all(streams.iter().map(|(_, stream)| stream.close())).await;
        for ((name, _), result) in streams.iter().zip(results) {
            if let Err(err) = result {
                tracing::warn!(stream = %name, error = %err, "failed to close stream");
            }
        }

        if let Some(token) = lock(&self.inner.control_token).take() {
            self.inner.connection.unregister_message_handler(token);
        }
        self.inner.connection.close().await?;
        Ok(())
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("streams", &self.stream_names())
            .finish()
    }
}

impl MuxInner {
    /// Drop `name` from the table if it still refers to stream `id`.
    fn deregister(&self, name: &str, id: u64) {
        let filter = {
            let mut state = lock(&self.state);
            match state.streams.get(name) {
                Some(entry) if entry.id == id => {
                    state.streams.remove(name).and_then(|entry| entry.filter)
                }
                _ => None,
            }
        };
        if let Some(token) = filter {
            self.connection.unregister_message_handler(token);
        }
        tracing::debug!(stream = name, "deregistered multiplexed stream");
    }

    fn has_stream(&self, name: &str) -> bool {
        lock(&self.state).streams.contains_key(name)
    }
}

/// Answers `message` envelopes for unknown streams with a single `close`.
fn control_listener(mux: Weak<MuxInner>) -> Listener<ChannelEvent> {
    Arc::new(move |ev: ChannelEvent| {
        let Some(message) = ev.into_message() else {
            return Reaction::ok();
        };
        if message.get_str("type") != Some(TYPE_MESSAGE) {
            return Reaction::ok();
        }
        let Some(mux) = mux.upgrade() else {
            return Reaction::ok();
        };
        let target = message.get_str("target").unwrap_or_default();
        if mux.has_stream(target) {
            return Reaction::ok();
        }

        tracing::debug!(stream = target, "closing unknown stream");
        let reply = control(TYPE_CLOSE, message.get("target").cloned().unwrap_or(Value::Null));
        Reaction::pending(async move {
            send_tolerating_close(&mux.connection, reply)
                .await
                .map_err(BoxError::from)
        })
    })
}

/// Everything one stream's listeners need.
#[derive(Clone)]
struct Stream {
    mux: Weak<MuxInner>,
    name: String,
    id: u64,
    ingress: Arc<MessageBus>,
    egress: Arc<MessageBus>,
    egress_token: TokenSlot,
}

impl Stream {
    /// Physical connection → ingress.
    fn filter_listener(&self) -> Listener<ChannelEvent> {
        let stream = self.clone();
        Arc::new(move |ev: ChannelEvent| {
            let message = match ev {
                ChannelEvent::Closed => {
                    let stream = stream.clone();
                    return Reaction::pending(async move { stream.close_ingress().await });
                }
                ChannelEvent::Data(message) => message,
            };
            if message.get_str("target") != Some(stream.name.as_str()) {
                return Reaction::ok();
            }

            let stream = stream.clone();
            if !is_message(&message.text) {
                return Reaction::pending(async move { stream.close_ingress().await });
            }
            let Message { text, blobs } = message;
            match text {
                Value::Object(mut fields) => match fields.remove("payload") {
                    Some(payload @ Value::Object(_)) => Reaction::pending(async move {
                        stream.deliver(Message { text: payload, blobs }).await
                    }),
                    _ => Reaction::pending(async move { stream.reject().await }),
                },
                _ => Reaction::ok(),
            }
        })
    }

    /// Egress → physical connection.
    fn egress_listener(&self) -> Listener<ChannelEvent> {
        let stream = self.clone();
        Arc::new(move |ev: ChannelEvent| {
            let stream = stream.clone();
            match ev {
                ChannelEvent::Data(message) => {
                    Reaction::pending(async move { stream.forward(message).await })
                }
                ChannelEvent::Closed => Reaction::pending(async move { stream.shutdown().await }),
            }
        })
    }

    async fn forward(&self, message: Message) -> std::result::Result<(), BoxError> {
        let mux = self.mux.upgrade().ok_or(ConnectionError::Closed)?;
        mux.connection.send(wrap(&self.name, message)).await?;
        Ok(())
    }

    async fn deliver(&self, message: Message) -> std::result::Result<(), BoxError> {
        match self.ingress.send(message).await {
            Err(ConnectionError::Closed) => {
                tracing::debug!(stream = %self.name, "dropping message for closed stream");
                Ok(())
            }
            other => Ok(other?),
        }
    }

    async fn close_ingress(&self) -> std::result::Result<(), BoxError> {
        self.ingress.close().await?;
        Ok(())
    }

    /// The peer sent a message without an object payload: tear the stream
    /// down without announcing a close.
    async fn reject(&self) -> std::result::Result<(), BoxError> {
        tracing::warn!(stream = %self.name, "illegal message, dropping stream");
        if let Some(mux) = self.mux.upgrade() {
            send_tolerating_close(&mux.connection, control(TYPE_ILLEGAL, self.name.as_str())).await?;
        }
        self.ingress.close().await?;
        if let Some(token) = lock(&self.egress_token).take() {
            self.egress.unregister_message_handler(token);
        }
        self.egress.close().await?;
        if let Some(mux) = self.mux.upgrade() {
            mux.deregister(&self.name, self.id);
        }
        Ok(())
    }

    /// The local side closed the stream.
    async fn shutdown(&self) -> std::result::Result<(), BoxError> {
        if let Some(mux) = self.mux.upgrade() {
            mux.deregister(&self.name, self.id);
            send_tolerating_close(&mux.connection, control(TYPE_CLOSE, self.name.as_str())).await?;
        }
        self.ingress.close().await?;
        Ok(())
    }
}

async fn send_tolerating_close(
    connection: &SharedConnection,
    message: Message,
) -> std::result::Result<(), ConnectionError> {
    match connection.send(message).await {
        Err(ConnectionError::Closed) => {
            tracing::debug!("physical connection already closed");
            Ok(())
        }
        other => other,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use msgprims_core::{inline_pipe, pipe, ConnectionExt};
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    fn recorder(conn: &dyn Connection) -> Arc<Mutex<Vec<ChannelEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        conn.on_event(move |ev| {
            sink.lock().unwrap().push(ev);
            Ok(())
        });
        seen
    }

    struct Harness {
        mux: Multiplexer,
        remote: SharedConnection,
        received: Arc<Mutex<Vec<ChannelEvent>>>,
    }

    fn harness() -> Harness {
        let (local, remote) = inline_pipe();
        let received = recorder(remote.as_ref());
        Harness {
            mux: Multiplexer::new(local),
            remote,
            received,
        }
    }

    fn data(text: serde_json::Value) -> ChannelEvent {
        ChannelEvent::Data(Message::new(text))
    }

    #[tokio::test]
    async fn unknown_targets_get_one_close_reply() {
        let h = harness();
        h.remote
            .send(Message::new(json!({"type": "message", "target": "unknown", "payload": {}})))
            .await
            .unwrap();

        assert_eq!(
            *h.received.lock().unwrap(),
            vec![data(json!({"type": "close", "target": "unknown", "payload": {}}))]
        );
    }

    #[tokio::test]
    async fn control_envelopes_for_unknown_targets_are_not_answered() {
        let h = harness();
        for kind in ["close", "illegal"] {
            h.remote
                .send(Message::new(json!({"type": kind, "target": "unknown", "payload": {}})))
                .await
                .unwrap();
        }
        assert!(h.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn known_stream_receives_unwrapped_payload() {
        let h = harness();
        let child = h.mux.register("known").unwrap();
        let child_seen = recorder(child.as_ref());

        h.remote
            .send(Message::with_blobs(
                json!({"type": "message", "target": "known", "payload": {"test": 1}}),
                [b"blob".to_vec()],
            ))
            .await
            .unwrap();

        assert_eq!(
            *child_seen.lock().unwrap(),
            vec![ChannelEvent::Data(Message::with_blobs(json!({"test": 1}), [b"blob".to_vec()]))]
        );
        assert!(h.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn illegal_payload_tears_down_stream_without_close_envelope() {
        let h = harness();
        let child = h.mux.register("known").unwrap();
        let child_seen = recorder(child.as_ref());

        h.remote
            .send(Message::new(json!({"type": "message", "target": "known", "payload": null})))
            .await
            .unwrap();

        assert_eq!(*child_seen.lock().unwrap(), vec![ChannelEvent::Closed]);
        assert_eq!(
            *h.received.lock().unwrap(),
            vec![data(json!({"type": "illegal", "target": "known", "payload": {}}))]
        );
        assert!(!h.mux.is_registered("known"));
        assert!(matches!(
            child.send(Message::empty()).await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn other_streams_are_not_disturbed() {
        let h = harness();
        let child = h.mux.register("known").unwrap();
        let child_seen = recorder(child.as_ref());
        h.mux.register("other").unwrap();

        h.remote
            .send(Message::new(json!({"type": "message", "target": "other", "payload": {}})))
            .await
            .unwrap();
        h.remote
            .send(Message::new(json!({"type": "message", "target": "unknown", "payload": {}})))
            .await
            .unwrap();

        assert!(child_seen.lock().unwrap().is_empty());
        assert_eq!(
            *h.received.lock().unwrap(),
            vec![data(json!({"type": "close", "target": "unknown", "payload": {}}))]
        );
    }

    #[tokio::test]
    async fn remote_close_closes_ingress_only() {
        let h = harness();
        let child = h.mux.register("known").unwrap();
        let child_seen = recorder(child.as_ref());

        h.remote
            .send(Message::new(json!({"type": "close", "target": "known", "payload": {}})))
            .await
            .unwrap();

        assert_eq!(*child_seen.lock().unwrap(), vec![ChannelEvent::Closed]);
        assert!(h.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn outbound_messages_are_wrapped() {
        let h = harness();
        let child = h.mux.register("known").unwrap();

        child
            .send(Message::with_blobs(json!({"test": 1}), [b"x".to_vec()]))
            .await
            .unwrap();

        assert_eq!(
            *h.received.lock().unwrap(),
            vec![ChannelEvent::Data(Message::with_blobs(
                json!({"type": "message", "target": "known", "payload": {"test": 1}}),
                [b"x".to_vec()]
            ))]
        );
    }

    #[tokio::test]
    async fn local_close_sends_close_and_deregisters() {
        let h = harness();
        let child = h.mux.register("known").unwrap();
        let child_seen = recorder(child.as_ref());

        child.close().await.unwrap();

        assert_eq!(
            *h.received.lock().unwrap(),
            vec![data(json!({"type": "close", "target": "known", "payload": {}}))]
        );
        assert_eq!(*child_seen.lock().unwrap(), vec![ChannelEvent::Closed]);
        assert!(!h.mux.is_registered("known"));

        h.remote
            .send(Message::new(json!({"type": "message", "target": "known", "payload": {}})))
            .await
            .unwrap();
        assert_eq!(h.received.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn register_is_idempotent_and_fails_after_close() {
        let h = harness();
        let first = h.mux.register("a").unwrap();
        let second = h.mux.register("a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        h.mux.register("b").unwrap();

        let mut names = h.mux.stream_names();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        h.mux.close().await.unwrap();
        assert!(matches!(h.mux.register("c"), Err(MuxError::Closed)));
        assert!(h.mux.stream_names().is_empty());

        let received = h.received.lock().unwrap().clone();
        assert!(received.contains(&data(json!({"type": "close", "target": "a", "payload": {}}))));
        assert!(received.contains(&data(json!({"type": "close", "target": "b", "payload": {}}))));
        assert_eq!(received.last(), Some(&ChannelEvent::Closed));
    }

    #[tokio::test]
    async fn physical_close_closes_every_stream() {
        let h = harness();
        let a = recorder(h.mux.register("a").unwrap().as_ref());
        let b = recorder(h.mux.register("b").unwrap().as_ref());

        h.remote.close().await.unwrap();

        assert_eq!(*a.lock().unwrap(), vec![ChannelEvent::Closed]);
        assert_eq!(*b.lock().unwrap(), vec![ChannelEvent::Closed]);
    }

    #[tokio::test]
    async fn two_multiplexers_talk_over_a_decoupled_pipe() {
        let (left, right) = pipe();
        let left = Multiplexer::new(left);
        let right = Multiplexer::new(right);

        let sender = left.register("video").unwrap();
        let receiver = right.register("video").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        receiver.on_event(move |ev| {
            let _ = tx.send(ev);
            Ok(())
        });

        sender.send(Message::new(json!({"frame": 1}))).await.unwrap();
        sender.close().await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(first, Some(data(json!({"frame": 1}))));
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(second, Some(ChannelEvent::Closed));
    }
}
