use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::{ConnectionError, Result};
use crate::handler::{detach_reaction, Handler, Listener, ListenerToken};
use crate::message::{ChannelEvent, Message};

/// A [`Connection`] whose sends are broadcast to its own listeners.
///
/// Two buses wired back-to-back through
/// [`SimpleConnection`](crate::SimpleConnection) form an in-process pipe.
#[derive(Debug, Default)]
pub struct MessageBus {
    handler: Handler<ChannelEvent>,
    closed: Mutex<bool>,
    // Held while listeners run synchronously, so no `Data` call starts after
    // the `Closed` call.
    delivery: Mutex<()>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        *self.state()
    }

    /// Number of listeners currently registered.
    pub fn listener_count(&self) -> usize {
        self.handler.len()
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        lock(&self.closed)
    }
}

#[async_trait]
impl Connection for MessageBus {
    fn register_message_handler(&self, listener: Listener<ChannelEvent>) -> Option<ListenerToken> {
        {
            let closed = self.state();
            if !*closed {
                return Some(self.handler.register(listener));
            }
        }
        detach_reaction(listener(ChannelEvent::Closed), "message bus late registration");
        None
    }

    fn unregister_message_handler(&self, token: ListenerToken) {
        self.handler.unregister(token);
    }

    async fn send(&self, message: Message) -> Result<()> {
        let invoked = {
            let _delivery = lock(&self.delivery);
            if self.is_closed() {
                return Err(ConnectionError::Closed);
            }
            self.handler.invoke(ChannelEvent::Data(message))
        };
        invoked.settle().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let invoked = {
            let _delivery = lock(&self.delivery);
            {
                let mut closed = self.state();
                if *closed {
                    return Ok(());
                }
                *closed = true;
            }
            let invoked = self.handler.invoke(ChannelEvent::Closed);
            self.handler.clear();
            invoked
        };
        invoked.settle().await?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::connection::ConnectionExt;

    fn collect(bus: &MessageBus) -> Arc<Mutex<Vec<ChannelEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on_event(move |ev| {
            sink.lock().unwrap().push(ev);
            Ok(())
        });
        seen
    }

    #[tokio::test]
    async fn every_listener_sees_each_message_before_send_returns() {
        let bus = MessageBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for index in 0..3 {
            let order = order.clone();
            bus.on_event(move |ev| {
                if let ChannelEvent::Data(message) = ev {
                    order.lock().unwrap().push((index, message.text));
                }
                Ok(())
            });
        }

        bus.send(Message::new(json!({"n": 1}))).await.unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec![(0, json!({"n": 1})), (1, json!({"n": 1})), (2, json!({"n": 1}))]
        );
    }

    #[tokio::test]
    async fn close_is_delivered_once_and_is_idempotent() {
        let bus = MessageBus::new();
        let seen = collect(&bus);

        bus.close().await.unwrap();
        bus.close().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![ChannelEvent::Closed]);
        assert!(bus.is_closed());
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn late_registration_gets_closed_immediately() {
        let bus = MessageBus::new();
        bus.close().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let token = bus.on_event(move |ev| {
            sink.lock().unwrap().push(ev);
            Ok(())
        });

        assert!(token.is_none());
        assert_eq!(*seen.lock().unwrap(), vec![ChannelEvent::Closed]);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let bus = MessageBus::new();
        bus.close().await.unwrap();

        let err = bus.send(Message::empty()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Closed));
    }

    #[tokio::test]
    async fn listener_failure_surfaces_as_aggregate() {
        let bus = MessageBus::new();
        bus.on_event(|_| Err("rejected".into()));
        let seen = collect(&bus);

        let err = bus.send(Message::empty()).await.unwrap_err();
        match err {
            ConnectionError::Aggregate(aggregate) => assert_eq!(aggregate.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unregistered_listener_misses_close() {
        let bus = MessageBus::new();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        let token = bus
            .on_event(move |_| {
                *sink.lock().unwrap() += 1;
                Ok(())
            })
            .expect("open bus returns a token");

        bus.unregister_message_handler(token);
        bus.close().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn data_never_follows_closed_when_send_races_close() {
        for _ in 0..200 {
            let bus = Arc::new(MessageBus::new());
            let seen = collect(&bus);

            let sender = bus.clone();
            let send = tokio::spawn(async move { sender.send(Message::new(json!(1))).await });
            let closer = bus.clone();
            let close = tokio::spawn(async move { closer.close().await });
            let sent = send.await.unwrap();
            close.await.unwrap().unwrap();

            let events = seen.lock().unwrap().clone();
            assert_eq!(events.last(), Some(&ChannelEvent::Closed));
            let closed_at = events.iter().position(ChannelEvent::is_closed).unwrap();
            assert_eq!(closed_at, events.len() - 1);
            assert_eq!(sent.is_ok(), events.len() == 2);
        }
    }
}
