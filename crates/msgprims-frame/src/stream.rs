use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, SinkExt, StreamExt};
use msgprims_core::{
    panic_message, BoxError, ChannelEvent, Connection, ConnectionError, Listener, ListenerToken,
    Message, MessageBus, Reaction,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{FrameConfig, MessageCodec};
use crate::error::FrameError;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingWork = BoxFuture<'static, Result<(), BoxError>>;

/// A [`Connection`] over an async byte stream.
///
/// A background reader task decodes frames into an ingress [`MessageBus`].
/// EOF or a decode error closes the ingress side, which notifies listeners
/// with [`ChannelEvent::Closed`]. `close()` flushes and shuts down the writer;
/// the reader keeps running until the peer closes its side.
///
/// Listeners run on the reader in arrival order, but the reader never waits
/// for their asynchronous work: pending reactions are handed to a separate
/// task, started in arrival order and awaited concurrently. A listener may
/// therefore await a reply that arrives on this same connection.
pub struct StreamConnection {
    ingress: Arc<MessageBus>,
    pending: mpsc::UnboundedSender<PendingWork>,
    writer: AsyncMutex<Option<FramedWrite<BoxedWriter, MessageCodec>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamConnection {
    /// Create a connection with default frame limits.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_config(reader, writer, FrameConfig::default())
    }

    /// Create a connection with explicit frame limits.
    pub fn with_config<R, W>(reader: R, writer: W, config: FrameConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let ingress = Arc::new(MessageBus::new());
        let frames = FramedRead::new(reader, MessageCodec::new(config.clone()));
        let reader_task = tokio::spawn(read_loop(frames, ingress.clone()));
        let (pending, queue) = mpsc::unbounded_channel();
        tokio::spawn(settle_loop(queue));
        let writer: BoxedWriter = Box::new(writer);

        Self {
            ingress,
            pending,
            writer: AsyncMutex::new(Some(FramedWrite::new(writer, MessageCodec::new(config)))),
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    /// Split a bidirectional stream and wrap both halves.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    /// Wrap a connected Unix domain socket.
    #[cfg(unix)]
    pub fn from_unix(stream: tokio::net::UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }

    /// Connect to a Unix domain socket at `path`.
    #[cfg(unix)]
    pub async fn connect_unix(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Self::from_unix(stream))
    }

    /// Returns true once the inbound side has ended.
    pub fn is_ingress_closed(&self) -> bool {
        self.ingress.is_closed()
    }
}

async fn read_loop<R>(mut frames: FramedRead<R, MessageCodec>, ingress: Arc<MessageBus>)
where
    R: AsyncRead + Unpin,
{
    while let Some(next) = frames.next().await {
        match next {
            Ok(message) => match ingress.send(message).await {
                Ok(()) => {}
                Err(ConnectionError::Closed) => return,
                Err(err) => tracing::warn!(error = %err, "inbound message listener failed"),
            },
            Err(err) => {
                tracing::warn!(error = %err, "failed to decode inbound frame");
                break;
            }
        }
    }

    tracing::debug!("stream ended, closing ingress");
    if let Err(err) = ingress.close().await {
        tracing::warn!(error = %err, "close listener failed");
    }
}

/// Drive listener work handed off by the reader until every sender is gone.
async fn settle_loop(mut queue: mpsc::UnboundedReceiver<PendingWork>) {
    let mut running = FuturesUnordered::new();
    loop {
        tokio::select! {
            next = queue.recv() => match next {
                Some(work) => running.push(AssertUnwindSafe(work).catch_unwind()),
                None => break,
            },
            Some(settled) = running.next(), if !running.is_empty() => report(settled),
        }
    }
    while let Some(settled) = running.next().await {
        report(settled);
    }
}

fn report(settled: std::thread::Result<Result<(), BoxError>>) {
    match settled {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(error = %err, "inbound message listener failed"),
        Err(payload) => tracing::warn!(
            panic = %panic_message(payload.as_ref()),
            "inbound message listener panicked"
        ),
    }
}

fn to_connection_error(err: FrameError) -> ConnectionError {
    match err {
        FrameError::Io(err) => ConnectionError::Io(err),
        other => ConnectionError::Transport(other.to_string()),
    }
}

#[async_trait]
impl Connection for StreamConnection {
    fn register_message_handler(&self, listener: Listener<ChannelEvent>) -> Option<ListenerToken> {
        let pending = self.pending.clone();
        self.ingress
            .register_message_handler(Arc::new(move |ev: ChannelEvent| match listener(ev) {
                Reaction::Pending(work) => {
                    if pending.send(work).is_err() {
                        tracing::warn!("listener task stopped, dropping pending work");
                    }
                    Reaction::ok()
                }
                ready => ready,
            }))
    }

    fn unregister_message_handler(&self, token: ListenerToken) {
        self.ingress.unregister_message_handler(token);
    }

    async fn send(&self, message: Message) -> msgprims_core::Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(framed) = writer.as_mut() else {
            return Err(ConnectionError::Closed);
        };
        framed.send(message).await.map_err(to_connection_error)
    }

    async fn close(&self) -> msgprims_core::Result<()> {
        let framed = self.writer.lock().await.take();
        if let Some(mut framed) = framed {
            framed.close().await.map_err(to_connection_error)?;
        }
        Ok(())
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        let task = self
            .reader_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use msgprims_core::ConnectionExt;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    use super::*;
    use crate::codec::encode_message;

    fn collect(conn: &StreamConnection) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        conn.on_event(move |ev| {
            let _ = tx.send(ev);
            Ok(())
        })
        .expect("open connection returns a token");
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event should arrive")
            .expect("listener should still be registered")
    }

    #[tokio::test]
    async fn messages_cross_the_stream_with_blobs() {
        let (left, right) = tokio::io::duplex(4096);
        let left = StreamConnection::from_stream(left);
        let right = StreamConnection::from_stream(right);
        let mut inbox = collect(&right);

        let message = Message::with_blobs(json!({"type": "frame"}), [b"plane-y".to_vec()]);
        left.send(message.clone()).await.unwrap();
        left.send(Message::new(json!({"type": "done"}))).await.unwrap();

        assert_eq!(next(&mut inbox).await, ChannelEvent::Data(message));
        assert_eq!(
            next(&mut inbox).await,
            ChannelEvent::Data(Message::new(json!({"type": "done"})))
        );
    }

    #[tokio::test]
    async fn close_reaches_peer_as_closed_event() {
        let (left, right) = tokio::io::duplex(1024);
        let left = StreamConnection::from_stream(left);
        let right = StreamConnection::from_stream(right);
        let mut inbox = collect(&right);

        left.close().await.unwrap();
        left.close().await.unwrap();

        assert_eq!(next(&mut inbox).await, ChannelEvent::Closed);
        assert!(right.is_ingress_closed());
        assert!(matches!(
            left.send(Message::empty()).await,
            Err(ConnectionError::Closed)
        ));
    }

    #[tokio::test]
    async fn garbage_on_the_wire_closes_ingress() {
        let (mut raw, remote) = tokio::io::duplex(1024);
        let conn = StreamConnection::from_stream(remote);
        let mut inbox = collect(&conn);

        let mut buf = BytesMut::new();
        encode_message(&Message::new(json!({"ok": true})), &mut buf).unwrap();
        raw.write_all(&buf).await.unwrap();
        raw.write_all(&0u32.to_be_bytes()).await.unwrap();

        assert_eq!(
            next(&mut inbox).await,
            ChannelEvent::Data(Message::new(json!({"ok": true})))
        );
        assert_eq!(next(&mut inbox).await, ChannelEvent::Closed);
    }

    #[tokio::test]
    async fn listener_failure_does_not_stop_reader() {
        let (left, right) = tokio::io::duplex(1024);
        let left = StreamConnection::from_stream(left);
        let right = StreamConnection::from_stream(right);
        right.on_event(|_| Err("rejected".into()));
        let mut inbox = collect(&right);

        left.send(Message::new(json!(1))).await.unwrap();
        left.send(Message::new(json!(2))).await.unwrap();

        assert_eq!(next(&mut inbox).await, ChannelEvent::Data(Message::new(json!(1))));
        assert_eq!(next(&mut inbox).await, ChannelEvent::Data(Message::new(json!(2))));
    }

    #[tokio::test]
    async fn async_listener_can_await_a_reply_on_the_same_connection() {
        let (left, right) = tokio::io::duplex(1024);
        let asker = Arc::new(StreamConnection::from_stream(left));
        let answerer = Arc::new(StreamConnection::from_stream(right));

        let replier = answerer.clone();
        answerer.on_event_async(move |ev| {
            let replier = replier.clone();
            async move {
                if ev.as_message().and_then(|m| m.get_str("q")) == Some("question") {
                    replier.send(Message::new(json!({"a": "answer"}))).await?;
                }
                Ok(())
            }
        });

        let (answer_tx, answer_rx) = tokio::sync::watch::channel(None);
        asker.on_event(move |ev| {
            if let Some(answer) = ev.as_message().and_then(|m| m.get_str("a")) {
                let _ = answer_tx.send(Some(answer.to_string()));
            }
            Ok(())
        });

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let sender = asker.clone();
        asker.on_event_async(move |ev| {
            let sender = sender.clone();
            let done_tx = done_tx.clone();
            let mut answers = answer_rx.clone();
            async move {
                if ev.as_message().and_then(|m| m.get_str("kick")).is_none() {
                    return Ok(());
                }
                sender.send(Message::new(json!({"q": "question"}))).await?;
                let answer = answers.wait_for(Option::is_some).await?.clone();
                let _ = done_tx.send(answer);
                Ok(())
            }
        });

        answerer.send(Message::new(json!({"kick": "go"}))).await.unwrap();
        let answer = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .expect("listener should finish while the reader keeps reading")
            .unwrap();
        assert_eq!(answer.as_deref(), Some("answer"));
    }
}
