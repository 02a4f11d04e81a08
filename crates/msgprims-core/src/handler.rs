use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, CatchUnwind};
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;

use crate::error::{panic_message, AggregateError, BoxError, ListenerPanicked};

/// How a listener finished handling one event.
pub enum Reaction {
    /// The listener completed synchronously.
    Ready(Result<(), BoxError>),
    /// The listener started asynchronous work that `emit` waits for.
    Pending(BoxFuture<'static, Result<(), BoxError>>),
}

impl Reaction {
    pub fn ok() -> Self {
        Reaction::Ready(Ok(()))
    }

    pub fn fail(err: impl Into<BoxError>) -> Self {
        Reaction::Ready(Err(err.into()))
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Reaction::Pending(Box::pin(future))
    }
}

impl From<Result<(), BoxError>> for Reaction {
    fn from(result: Result<(), BoxError>) -> Self {
        Reaction::Ready(result)
    }
}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reaction::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Reaction::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

/// A registered event callback.
pub type Listener<T> = Arc<dyn Fn(T) -> Reaction + Send + Sync>;

/// Opaque registration handle, only useful for unregistering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerToken(u64);

impl ListenerToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Fan-out event dispatcher.
///
/// Listeners run in registration order on a snapshot taken when `emit` starts,
/// so registering or unregistering from inside a listener only affects later
/// emits. Tokens come from a per-handler counter.
pub struct Handler<T> {
    listeners: Mutex<BTreeMap<u64, Listener<T>>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> Handler<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a listener and return its token.
    pub fn register(&self, listener: Listener<T>) -> ListenerToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, listener);
        ListenerToken(id)
    }

    /// Register a synchronous listener.
    pub fn register_fn<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(T) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.register(Arc::new(move |ev| Reaction::Ready(listener(ev))))
    }

    /// Register an asynchronous listener.
    pub fn register_async<F, Fut>(&self, listener: F) -> ListenerToken
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.register(Arc::new(move |ev| Reaction::pending(listener(ev))))
    }

    /// Remove a listener. Returns false if the token was not registered.
    pub fn unregister(&self, token: ListenerToken) -> bool {
        self.lock().remove(&token.0).is_some()
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Deliver `ev` to every listener registered right now.
    ///
    /// Completes after all synchronous listeners ran and all pending ones
    /// settled. Fails with every collected error if any listener failed.
    pub async fn emit(&self, ev: T) -> Result<(), AggregateError> {
        self.invoke(ev).settle().await
    }

    /// Run every listener's synchronous part now and return the work that is
    /// still pending.
    pub fn invoke(&self, ev: T) -> Invoked {
        let snapshot: Vec<Listener<T>> = self.lock().values().cloned().collect();

        let mut invoked = Invoked {
            errors: Vec::new(),
            pending: FuturesUnordered::new(),
        };
        for listener in snapshot {
            let event = ev.clone();
            match std::panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Reaction::Ready(Ok(()))) => {}
                Ok(Reaction::Ready(Err(err))) => invoked.errors.push(err),
                Ok(Reaction::Pending(future)) => {
                    invoked.pending.push(AssertUnwindSafe(future).catch_unwind());
                }
                Err(payload) => invoked.errors.push(panicked(payload.as_ref())),
            }
        }
        invoked
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Listener<T>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone + Send + 'static> Default for Handler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Handler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.listeners.lock().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("Handler").field("listeners", &count).finish()
    }
}

type SettlingReaction = CatchUnwind<AssertUnwindSafe<BoxFuture<'static, Result<(), BoxError>>>>;

/// Listener work left over after [`Handler::invoke`].
pub struct Invoked {
    errors: Vec<BoxError>,
    pending: FuturesUnordered<SettlingReaction>,
}

impl Invoked {
    /// Wait for every pending reaction. Synchronous failures come first in
    /// call order, then asynchronous ones in settlement order.
    pub async fn settle(self) -> Result<(), AggregateError> {
        let Invoked {
            mut errors,
            mut pending,
        } = self;
        while let Some(settled) = pending.next().await {
            match settled {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(payload) => errors.push(panicked(payload.as_ref())),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError::new(errors))
        }
    }
}

impl fmt::Debug for Invoked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invoked")
            .field("errors", &self.errors.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn panicked(payload: &(dyn std::any::Any + Send)) -> BoxError {
    Box::new(ListenerPanicked(panic_message(payload)))
}

/// Run a reaction nobody is waiting for.
///
/// Pending work is spawned on the ambient Tokio runtime; failures are logged.
pub(crate) fn detach_reaction(reaction: Reaction, context: &'static str) {
    match reaction {
        Reaction::Ready(Ok(())) => {}
        Reaction::Ready(Err(err)) => {
            tracing::warn!(context, error = %err, "detached listener failed");
        }
        Reaction::Pending(future) => match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = future.await {
                        tracing::warn!(context, error = %err, "detached listener failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(context, "no runtime available, dropping pending listener");
            }
        },
    }
}
