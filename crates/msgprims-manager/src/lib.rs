//! Reference-counted remote object directory.
//!
//! A [`LocalManager`] publishes named services on an
//! [`RpcServer`](msgprims_rpc::RpcServer) under the well-known target
//! [`MANAGER_ID`]. A [`RemoteManager`] on the other side checks the protocol
//! version, then acquires services as [`ManagedObject`] proxies and releases
//! them when done.

pub mod error;
pub mod local;
pub mod protocol;
pub mod remote;

use msgprims_core::SharedConnection;
use msgprims_rpc::{RpcClient, RpcServer};

pub use error::{ManagerError, Result};
pub use local::LocalManager;
pub use protocol::{VersionInfo, MANAGER_ID, MANAGER_METHODS, MANAGER_TYPE, PROTOCOL_VERSION};
pub use remote::{ManagedObject, RemoteManager};

/// Serve and call the directory over one connection.
///
/// Both the server and the client listen on `connection`; requests and
/// replies are told apart by their `type`. Returns after the handshake.
pub async fn make_managed_connection(
    connection: SharedConnection,
) -> Result<(LocalManager, RemoteManager)> {
    let local = LocalManager::new(RpcServer::new(connection.clone()));
    let remote = RemoteManager::create(RpcClient::new(connection)).await?;
    Ok((local, remote))
}
