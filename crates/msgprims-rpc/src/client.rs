use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use msgprims_core::{ChannelEvent, ListenerToken, Message, Reaction, SharedConnection};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::envelope::{empty_object, Envelope, ErrorCode, TYPE_ERROR, TYPE_RESPONSE};
use crate::error::{Result, RpcError};

/// Client-side call settings.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Timeout applied to calls that don't pass one explicitly.
    /// `None` waits forever.
    pub default_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

type Waiter = oneshot::Sender<Result<Message>>;

#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, Waiter>,
    closed: bool,
}

struct ClientInner {
    connection: SharedConnection,
    config: ClientConfig,
    next_id: AtomicU64,
    pending: Mutex<Pending>,
    types: Mutex<HashMap<String, Arc<[String]>>>,
    token: Mutex<Option<ListenerToken>>,
}

/// Makes remote calls over one connection.
///
/// Cloning is cheap; clones share the id counter, the declared proxy types and
/// the outstanding calls.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub fn new(connection: SharedConnection) -> Self {
        Self::with_config(connection, ClientConfig::default())
    }

    pub fn with_config(connection: SharedConnection, config: ClientConfig) -> Self {
        let inner = Arc::new(ClientInner {
            connection: connection.clone(),
            config,
            next_id: AtomicU64::new(0),
            pending: Mutex::new(Pending::default()),
            types: Mutex::new(HashMap::new()),
            token: Mutex::new(None),
        });

        let weak: Weak<ClientInner> = Arc::downgrade(&inner);
        let token = connection.register_message_handler(Arc::new(move |ev: ChannelEvent| {
            if let Some(inner) = weak.upgrade() {
                match ev {
                    ChannelEvent::Data(message) => inner.dispatch(message),
                    ChannelEvent::Closed => inner.fail_all(),
                }
            }
            Reaction::ok()
        }));
        *lock(&inner.token) = token;

        Self { inner }
    }

    /// Flat single-target client: a proxy for target `""` with `methods`.
    pub fn create<I, S>(connection: SharedConnection, methods: I) -> Result<RemoteObject>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new(connection);
        let methods = validate_methods(methods)?;
        Ok(RemoteObject::new(client, String::new(), String::new(), methods))
    }

    /// Declare the method list of a proxy type.
    ///
    /// Fails on empty or duplicate method names. Redeclaring a type replaces
    /// its method list.
    pub fn register_type<I, S>(&self, type_name: impl Into<String>, methods: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let methods = validate_methods(methods)?;
        lock(&self.inner.types).insert(type_name.into(), methods);
        Ok(())
    }

    pub fn has_type(&self, type_name: &str) -> bool {
        lock(&self.inner.types).contains_key(type_name)
    }

    /// Proxy for the object exported under `target`, typed as `type_name`.
    pub fn get(&self, target: impl Into<String>, type_name: &str) -> Result<RemoteObject> {
        let methods = lock(&self.inner.types)
            .get(type_name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownType(type_name.to_string()))?;
        Ok(RemoteObject::new(
            self.clone(),
            target.into(),
            type_name.to_string(),
            methods,
        ))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.inner.connection
    }

    /// Number of calls waiting for a reply.
    pub fn outstanding(&self) -> usize {
        lock(&self.inner.pending).waiters.len()
    }

    /// Stop listening, fail outstanding calls and close the connection.
    pub async fn close(&self) -> Result<()> {
        if let Some(token) = lock(&self.inner.token).take() {
            self.inner.connection.unregister_message_handler(token);
        }
        self.inner.fail_all();
        self.inner.connection.close().await?;
        Ok(())
    }

    async fn call(
        &self,
        target: &str,
        method: &str,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Envelope::Request {
            id,
            target: target.to_string(),
            method: method.to_string(),
            params: message.text,
        }
        .into_message(message.blobs)?;

        let receiver = self.inner.wait_for(id)?;
        let _waiter = WaiterGuard {
            inner: &self.inner,
            id,
        };
        tracing::trace!(id, target_name = target, method, "sending rpc request");
        self.inner.connection.send(request).await?;

        let outcome = match timeout.or(self.inner.config.default_timeout) {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::debug!(id, method, "rpc call timed out, abandoning");
                    return Err(RpcError::Timeout(limit));
                }
            },
            None => receiver.await,
        };
        outcome.unwrap_or(Err(RpcError::ConnectionClosed))
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("config", &self.inner.config)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl ClientInner {
    fn wait_for(&self, id: u64) -> Result<oneshot::Receiver<Result<Message>>> {
        let mut pending = lock(&self.pending);
        if pending.closed {
            return Err(RpcError::ConnectionClosed);
        }
        let (sender, receiver) = oneshot::channel();
        pending.waiters.insert(id, sender);
        Ok(receiver)
    }

    fn forget(&self, id: u64) {
        lock(&self.pending).waiters.remove(&id);
    }

    fn fail_all(&self) {
        let waiters: Vec<Waiter> = {
            let mut pending = lock(&self.pending);
            pending.closed = true;
            pending.waiters.drain().map(|(_, waiter)| waiter).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(RpcError::ConnectionClosed));
        }
    }

    fn dispatch(&self, message: Message) {
        let kind = match message.get_str("type") {
            Some(kind @ (TYPE_RESPONSE | TYPE_ERROR)) => kind,
            _ => {
                tracing::debug!("ignoring message that is not a reply");
                return;
            }
        };
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            tracing::debug!("ignoring reply without a usable id");
            return;
        };
        let Some(waiter) = lock(&self.pending).waiters.remove(&id) else {
            tracing::debug!(id, "ignoring unmatched reply");
            return;
        };

        let outcome = if kind == TYPE_RESPONSE {
            let text = message.get("result").cloned().unwrap_or_else(empty_object);
            Ok(Message {
                text,
                blobs: message.blobs,
            })
        } else {
            Err(RpcError::Remote {
                code: ErrorCode::from_wire(message.get_str("code")),
                message: message
                    .get_str("error")
                    .unwrap_or("Remote error while handling request.")
                    .to_string(),
            })
        };
        let _ = waiter.send(outcome);
    }
}

/// Drops the waiter for `id` when the call ends, however it ends.
struct WaiterGuard<'a> {
    inner: &'a ClientInner,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.inner.forget(self.id);
    }
}

fn validate_methods<I, S>(methods: I) -> Result<Arc<[String]>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    let mut list = Vec::new();
    for method in methods {
        let method = method.into();
        if method.is_empty() || !seen.insert(method.clone()) {
            return Err(RpcError::InvalidMethodName(method));
        }
        list.push(method);
    }
    Ok(list.into())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Proxy for one remote object.
///
/// Only the declared methods can be called; anything else fails before a
/// request is sent.
#[derive(Clone)]
pub struct RemoteObject {
    client: RpcClient,
    target: String,
    type_name: String,
    methods: Arc<[String]>,
}

impl RemoteObject {
    fn new(client: RpcClient, target: String, type_name: String, methods: Arc<[String]>) -> Self {
        Self {
            client,
            target,
            type_name,
            methods,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Close the underlying client. Every proxy sharing it stops working.
    pub async fn close(&self) -> Result<()> {
        self.client.close().await
    }

    /// Call `method` with the client's default timeout.
    pub async fn call(&self, method: &str, message: Message) -> Result<Message> {
        self.ensure_declared(method)?;
        self.client.call(&self.target, method, message, None).await
    }

    /// Call `method`, giving up after `timeout`.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        self.ensure_declared(method)?;
        self.client
            .call(&self.target, method, message, Some(timeout))
            .await
    }

    /// Bind one declared method.
    pub fn method(&self, name: &str) -> Result<RemoteMethod> {
        self.ensure_declared(name)?;
        Ok(RemoteMethod {
            object: self.clone(),
            name: name.to_string(),
        })
    }

    fn ensure_declared(&self, method: &str) -> Result<()> {
        if self.has_method(method) {
            Ok(())
        } else {
            Err(RpcError::UndeclaredMethod {
                type_name: self.type_name.clone(),
                method: method.to_string(),
            })
        }
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("target", &self.target)
            .field("type_name", &self.type_name)
            .field("methods", &self.methods)
            .finish()
    }
}

/// A bound method of a [`RemoteObject`].
#[derive(Debug, Clone)]
pub struct RemoteMethod {
    object: RemoteObject,
    name: String,
}

impl RemoteMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, message: Message) -> Result<Message> {
        self.object.call(&self.name, message).await
    }

    pub async fn call_with_timeout(&self, message: Message, timeout: Duration) -> Result<Message> {
        self.object
            .call_with_timeout(&self.name, message, timeout)
            .await
    }
}
