use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use msgprims_core::{BoxError, Message};
use msgprims_rpc::{RpcObject, RpcServer};
use uuid::Uuid;

use crate::protocol::{
    from_message, to_message, AcquireReply, ExistsReply, ReleaseReply, VersionInfo,
    VersionRequest, MANAGER_ID, METHOD_ACQUIRE_OBJECT, METHOD_HAS_SERVICE, METHOD_RELEASE_OBJECT,
    METHOD_VERSION, PROTOCOL_VERSION,
};

struct Service {
    object: RpcObject,
    temporary: bool,
}

struct LocalInner {
    server: RpcServer,
    services: Mutex<HashMap<String, Service>>,
    exported: Mutex<HashSet<String>>,
}

/// The serving half of the object directory.
///
/// Registers itself on the server under [`MANAGER_ID`]. Services are
/// published by name; every acquisition exports the service object under a
/// fresh id until the peer releases it. Temporary services can be acquired
/// once.
///
/// The manager owns its server. Dropping every clone stops the directory.
#[derive(Clone)]
pub struct LocalManager {
    inner: Arc<LocalInner>,
}

impl LocalManager {
    pub fn new(server: RpcServer) -> Self {
        let inner = Arc::new(LocalInner {
            server: server.clone(),
            services: Mutex::new(HashMap::new()),
            exported: Mutex::new(HashSet::new()),
        });
        server.register(MANAGER_ID, manager_object(Arc::downgrade(&inner)));
        Self { inner }
    }

    /// Publish `object` for a single acquisition under a fresh name.
    pub fn add_temporary_object(&self, object: RpcObject) -> String {
        let name = Uuid::new_v4().to_string();
        lock(&self.inner.services).insert(
            name.clone(),
            Service {
                object,
                temporary: true,
            },
        );
        name
    }

    /// Publish `object` under `name`, replacing any previous service.
    pub fn add_service(&self, name: impl Into<String>, object: RpcObject) {
        lock(&self.inner.services).insert(
            name.into(),
            Service {
                object,
                temporary: false,
            },
        );
    }

    /// Withdraw a service. Objects already acquired stay exported.
    pub fn remove_service(&self, name: &str) {
        lock(&self.inner.services).remove(name);
    }

    pub fn has_service(&self, name: &str) -> bool {
        lock(&self.inner.services).contains_key(name)
    }

    /// Ids of the objects currently exported to the peer.
    pub fn exported_objects(&self) -> Vec<String> {
        lock(&self.inner.exported).iter().cloned().collect()
    }

    pub fn server(&self) -> &RpcServer {
        &self.inner.server
    }
}

impl std::fmt::Debug for LocalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalManager")
            .field("services", &lock(&self.inner.services).keys().collect::<Vec<_>>())
            .field("exported", &lock(&self.inner.exported).len())
            .finish()
    }
}

impl LocalInner {
    fn version(&self, message: Message) -> Result<Message, BoxError> {
        let request: VersionRequest = from_message(&message)?;
        if let Some(supported) = request.supported {
            if !supported.iter().any(|v| v.version == PROTOCOL_VERSION) {
                return Err(format!("no common protocol version (local: {PROTOCOL_VERSION})").into());
            }
        }
        Ok(to_message(&VersionInfo::current())?)
    }

    fn has_service(&self, message: Message) -> Result<Message, BoxError> {
        let exists = match message.get_str("service") {
            Some(name) => lock(&self.services).contains_key(name),
            None => false,
        };
        Ok(to_message(&ExistsReply { exists })?)
    }

    fn acquire_object(&self, message: Message) -> Result<Message, BoxError> {
        let object = message.get_str("service").and_then(|name| {
            let mut services = lock(&self.services);
            let temporary = services.get(name)?.temporary;
            if temporary {
                services.remove(name).map(|service| service.object)
            } else {
                services.get(name).map(|service| service.object.clone())
            }
        });
        let Some(object) = object else {
            return Ok(to_message(&AcquireReply {
                exists: false,
                id: None,
            })?);
        };

        let id = Uuid::new_v4().to_string();
        self.server.register(id.clone(), object);
        lock(&self.exported).insert(id.clone());
        tracing::debug!(object_id = %id, "exported managed object");

        Ok(to_message(&AcquireReply {
            exists: true,
            id: Some(id),
        })?)
    }

    fn release_object(&self, message: Message) -> Result<Message, BoxError> {
        if let Some(id) = message.get_str("obj") {
            if lock(&self.exported).remove(id) {
                self.server.unregister(id);
                tracing::debug!(object_id = %id, "released managed object");
            }
        }
        Ok(to_message(&ReleaseReply { removed: true })?)
    }
}

fn manager_object(manager: Weak<LocalInner>) -> RpcObject {
    type Method = fn(&LocalInner, Message) -> Result<Message, BoxError>;
    let methods: [(&str, Method); 4] = [
        (METHOD_VERSION, LocalInner::version),
        (METHOD_HAS_SERVICE, LocalInner::has_service),
        (METHOD_ACQUIRE_OBJECT, LocalInner::acquire_object),
        (METHOD_RELEASE_OBJECT, LocalInner::release_object),
    ];

    methods
        .into_iter()
        .fold(RpcObject::new(), |object, (name, method)| {
            let manager = manager.clone();
            object.method_sync(name, move |message| {
                let manager = manager.upgrade().ok_or("manager is gone")?;
                method(&manager, message)
            })
        })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
