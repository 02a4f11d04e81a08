use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::FutureExt;
use msgprims_core::{
    panic_message, BoxError, ChannelEvent, ConnectionError, ListenerToken, Message, Reaction,
    SharedConnection,
};
use serde_json::{Map, Value};

use crate::envelope::{empty_object, Envelope, ErrorCode, TYPE_REQUEST};
use crate::object::{MethodHandler, RpcObject};

/// Serves remote calls for a table of named objects on one connection.
///
/// Cloning is cheap; every clone serves the same table.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

/// Non-owning handle to an [`RpcServer`].
#[derive(Clone)]
pub struct WeakRpcServer {
    inner: Weak<ServerInner>,
}

impl WeakRpcServer {
    pub fn upgrade(&self) -> Option<RpcServer> {
        self.inner.upgrade().map(|inner| RpcServer { inner })
    }
}

struct ServerInner {
    connection: SharedConnection,
    objects: Mutex<HashMap<String, RpcObject>>,
    token: Mutex<Option<ListenerToken>>,
}

/// A request that passed validation, ready to run.
struct Invocation {
    id: u64,
    handler: MethodHandler,
    params: Message,
}

impl RpcServer {
    /// Start serving on `connection`.
    pub fn new(connection: SharedConnection) -> Self {
        let inner = Arc::new(ServerInner {
            connection: connection.clone(),
            objects: Mutex::new(HashMap::new()),
            token: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let token = connection.register_message_handler(Arc::new(move |ev: ChannelEvent| {
            let Some(inner) = weak.upgrade() else {
                return Reaction::ok();
            };
            match ev {
                ChannelEvent::Closed => {
                    inner.detach();
                    Reaction::ok()
                }
                ChannelEvent::Data(message) => inner.on_message(message),
            }
        }));
        *lock(&inner.token) = token;

        Self { inner }
    }

    /// Export `object` under `name`, replacing any previous object.
    pub fn register(&self, name: impl Into<String>, object: RpcObject) {
        let name = name.into();
        tracing::debug!(target_name = %name, "registering rpc object");
        lock(&self.inner.objects).insert(name, object);
    }

    /// Stop exporting `name`. Returns false if nothing was registered.
    pub fn unregister(&self, name: &str) -> bool {
        lock(&self.inner.objects).remove(name).is_some()
    }

    pub fn has_target(&self, name: &str) -> bool {
        lock(&self.inner.objects).contains_key(name)
    }

    /// Names of every exported object.
    pub fn targets(&self) -> Vec<String> {
        lock(&self.inner.objects).keys().cloned().collect()
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.inner.connection
    }

    pub fn downgrade(&self) -> WeakRpcServer {
        WeakRpcServer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Stop listening and close the connection.
    pub async fn close(&self) -> msgprims_core::Result<()> {
        self.inner.detach();
        self.inner.connection.close().await
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("targets", &self.targets())
            .finish()
    }
}

impl ServerInner {
    fn detach(&self) {
        if let Some(token) = lock(&self.token).take() {
            self.connection.unregister_message_handler(token);
        }
    }

    fn on_message(&self, message: Message) -> Reaction {
        let Some(fields) = message.as_object() else {
            tracing::debug!("ignoring non-object message");
            return Reaction::ok();
        };
        if fields.get("type").and_then(Value::as_str) != Some(TYPE_REQUEST) {
            tracing::debug!("ignoring non-request message");
            return Reaction::ok();
        }
        let Some(id) = fields.get("id").and_then(Value::as_u64) else {
            tracing::debug!("dropping request without a usable id");
            return Reaction::ok();
        };

        match self.resolve(id, fields, message.blobs.clone()) {
            Ok(invocation) => {
                tokio::spawn(invoke(self.connection.clone(), invocation));
                Reaction::ok()
            }
            Err((code, reason)) => {
                tracing::debug!(id, %code, reason, "rejecting request");
                let connection = self.connection.clone();
                Reaction::pending(async move {
                    send_reply(&connection, Envelope::error(id, code, reason), Vec::new()).await;
                    Ok::<(), BoxError>(())
                })
            }
        }
    }

    fn resolve(
        &self,
        id: u64,
        fields: &Map<String, Value>,
        blobs: Vec<bytes::Bytes>,
    ) -> Result<Invocation, (ErrorCode, &'static str)> {
        let method = fields
            .get("method")
            .and_then(Value::as_str)
            .ok_or((ErrorCode::MalformedRequest, "Method name is missing."))?;
        let target = fields
            .get("target")
            .and_then(Value::as_str)
            .ok_or((ErrorCode::MalformedRequest, "Target is missing."))?;
        let params = match fields.get("params") {
            None | Some(Value::Null) => empty_object(),
            Some(params @ Value::Object(_)) => params.clone(),
            Some(_) => return Err((ErrorCode::MalformedRequest, "Params must be an object.")),
        };

        let objects = lock(&self.objects);
        let object = objects
            .get(target)
            .ok_or((ErrorCode::UnknownTarget, "Unknown target."))?;
        let handler = object
            .handler(method)
            .ok_or((ErrorCode::UnknownMethod, "Unknown method."))?;

        Ok(Invocation {
            id,
            handler,
            params: Message { text: params, blobs },
        })
    }
}

async fn invoke(connection: SharedConnection, invocation: Invocation) {
    let Invocation {
        id,
        handler,
        params,
    } = invocation;

    let outcome = AssertUnwindSafe(async move { handler(params).await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(result)) => {
            let envelope = Envelope::Response {
                id,
                result: result.text,
            };
            send_reply(&connection, envelope, result.blobs).await;
        }
        Ok(Err(err)) => {
            let envelope = Envelope::error(id, ErrorCode::InvocationFailed, describe(err.as_ref()));
            send_reply(&connection, envelope, Vec::new()).await;
        }
        Err(payload) => {
            let message = format!(
                "Error during RPC invocation: handler panicked: {}",
                panic_message(payload.as_ref())
            );
            tracing::error!(id, %message, "rpc handler panicked");
            send_reply(&connection, Envelope::error(id, ErrorCode::InvocationFailed, message), Vec::new())
                .await;
        }
    }
}

fn describe(err: &(dyn std::error::Error + Send + Sync + 'static)) -> String {
    let mut text = format!("Error during RPC invocation: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str("\ncaused by: ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

async fn send_reply(connection: &SharedConnection, envelope: Envelope, blobs: Vec<bytes::Bytes>) {
    let id = envelope.id();
    let message = match envelope.into_message(blobs) {
        Ok(message) => message,
        Err(err) => {
            tracing::error!(id, error = %err, "failed to encode rpc reply");
            return;
        }
    };
    match connection.send(message).await {
        Ok(()) => {}
        Err(ConnectionError::Closed) => {
            tracing::debug!(id, "connection closed before reply was sent");
        }
        Err(err) => tracing::error!(id, error = %err, "failed to send rpc reply"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
