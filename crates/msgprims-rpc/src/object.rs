use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use msgprims_core::{BoxError, Message};

/// The future a method returns.
pub type MethodFuture = BoxFuture<'static, Result<Message, BoxError>>;

/// A type-erased method implementation.
pub type MethodHandler = Arc<dyn Fn(Message) -> MethodFuture + Send + Sync>;

/// Trait for objects that dispatch their own method calls.
///
/// Implementors must tolerate overlapping invocations: the server does not
/// serialize calls per object.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Names of the methods this service answers.
    fn methods(&self) -> Vec<String>;

    /// Handle one call of `method`.
    async fn invoke(&self, method: &str, message: Message) -> Result<Message, BoxError>;
}

/// An explicit method-name to handler table, exported by an
/// [`RpcServer`](crate::RpcServer) under a target name.
#[derive(Clone, Default)]
pub struct RpcObject {
    methods: BTreeMap<String, MethodHandler>,
}

impl RpcObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an async method.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Message, BoxError>> + Send + 'static,
    {
        self.insert(
            name,
            Arc::new(move |message| -> MethodFuture { Box::pin(handler(message)) }),
        );
        self
    }

    /// Add a method that completes synchronously.
    pub fn method_sync<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Message) -> Result<Message, BoxError> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.method(name, move |message| {
            let handler = handler.clone();
            async move { handler(message) }
        })
    }

    /// Build an object that forwards every declared method to `service`.
    pub fn from_service<S: RpcService>(service: Arc<S>) -> Self {
        let mut object = Self::new();
        for name in service.methods() {
            let service = service.clone();
            let method = name.clone();
            object.insert(
                name,
                Arc::new(move |message| -> MethodFuture {
                    let service = service.clone();
                    let method = method.clone();
                    Box::pin(async move { service.invoke(&method, message).await })
                }),
            );
        }
        object
    }

    /// Insert or replace a method.
    pub fn insert(&mut self, name: impl Into<String>, handler: MethodHandler) {
        self.methods.insert(name.into(), handler);
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn handler(&self, name: &str) -> Option<MethodHandler> {
        self.methods.get(name).cloned()
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

impl fmt::Debug for RpcObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcObject")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}
