use std::ops::Deref;

use msgprims_rpc::{RemoteObject, RpcClient, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ManagerError, Result};
use crate::protocol::{
    from_message, to_message, AcquireReply, ExistsReply, ReleaseReply, ReleaseRequest,
    ServiceRequest, VersionInfo, VersionRequest, MANAGER_ID, MANAGER_METHODS, MANAGER_TYPE,
    METHOD_ACQUIRE_OBJECT, METHOD_HAS_SERVICE, METHOD_RELEASE_OBJECT, METHOD_VERSION,
    PROTOCOL_VERSION,
};

/// The calling half of the object directory.
#[derive(Debug, Clone)]
pub struct RemoteManager {
    client: RpcClient,
    proxy: RemoteObject,
    version: VersionInfo,
}

impl RemoteManager {
    /// Declare the manager proxy on `client` and run the version handshake.
    pub async fn create(client: RpcClient) -> Result<Self> {
        client.register_type(MANAGER_TYPE, MANAGER_METHODS)?;
        let proxy = client.get(MANAGER_ID, MANAGER_TYPE)?;

        let request = VersionRequest {
            supported: Some(vec![VersionInfo::current()]),
        };
        let version: VersionInfo = invoke(&proxy, METHOD_VERSION, &request).await?;
        if version.version != PROTOCOL_VERSION {
            return Err(ManagerError::UnsupportedVersion(version.version));
        }
        tracing::debug!(version = version.version, "manager handshake complete");

        Ok(Self {
            client,
            proxy,
            version,
        })
    }

    /// The version the remote manager agreed to.
    pub fn version(&self) -> &VersionInfo {
        &self.version
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Ask whether the remote side publishes `name`.
    pub async fn has(&self, name: &str) -> Result<bool> {
        let reply: ExistsReply = invoke(
            &self.proxy,
            METHOD_HAS_SERVICE,
            &ServiceRequest {
                service: name.to_string(),
            },
        )
        .await?;
        Ok(reply.exists)
    }

    /// Acquire the service `name` as a proxy of `type_name`.
    ///
    /// Returns `None` if the service does not exist (or was a temporary
    /// object that has already been taken). The type must be declared on the
    /// client beforehand.
    pub async fn get(&self, name: &str, type_name: &str) -> Result<Option<ManagedObject>> {
        if !self.client.has_type(type_name) {
            return Err(RpcError::UnknownType(type_name.to_string()).into());
        }

        let reply: AcquireReply = invoke(
            &self.proxy,
            METHOD_ACQUIRE_OBJECT,
            &ServiceRequest {
                service: name.to_string(),
            },
        )
        .await?;
        if !reply.exists {
            return Ok(None);
        }
        let id = reply
            .id
            .ok_or_else(|| ManagerError::MalformedReply("acquired object has no id".into()))?;

        let object = self.client.get(id.clone(), type_name)?;
        Ok(Some(ManagedObject {
            object,
            manager: self.proxy.clone(),
            id,
        }))
    }

    /// Close the underlying client.
    pub async fn close(&self) -> Result<()> {
        self.client.close().await?;
        Ok(())
    }
}

/// A remote object acquired through a [`RemoteManager`].
///
/// Derefs to the [`RemoteObject`] proxy. `close()` releases the remote export;
/// calls made after that fail with an `unknown_target` error.
#[derive(Debug, Clone)]
pub struct ManagedObject {
    object: RemoteObject,
    manager: RemoteObject,
    id: String,
}

impl ManagedObject {
    /// The id the object is exported under.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote(&self) -> &RemoteObject {
        &self.object
    }

    /// Release the remote export.
    pub async fn close(&self) -> Result<()> {
        let reply: ReleaseReply = invoke(
            &self.manager,
            METHOD_RELEASE_OBJECT,
            &ReleaseRequest {
                obj: self.id.clone(),
            },
        )
        .await?;
        if !reply.removed {
            tracing::warn!(object_id = %self.id, "remote manager did not confirm release");
        }
        Ok(())
    }
}

impl Deref for ManagedObject {
    type Target = RemoteObject;

    fn deref(&self) -> &RemoteObject {
        &self.object
    }
}

async fn invoke<Req, Reply>(proxy: &RemoteObject, method: &str, request: &Req) -> Result<Reply>
where
    Req: Serialize,
    Reply: DeserializeOwned,
{
    let message = to_message(request).map_err(RpcError::from)?;
    let reply = proxy.call(method, message).await?;
    from_message(&reply).map_err(|err| ManagerError::MalformedReply(format!("{method}: {err}")))
}
