use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use msgprims_core::{BoxError, ConnectionExt, Message, SharedConnection};
use msgprims_frame::StreamConnection;
use msgprims_manager::LocalManager;
use msgprims_rpc::{RpcObject, RpcServer, RpcService};
use serde_json::json;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

use crate::cmd::ServeArgs;
use crate::exit::{io_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_listening, OutputFormat};

pub const ECHO_SERVICE: &str = "echo";

/// Permanent service published on every connection.
///
/// `echo` returns its parameters and blobs unchanged; `ping` answers
/// `{"pong": true}`.
pub struct EchoService;

#[async_trait]
impl RpcService for EchoService {
    fn methods(&self) -> Vec<String> {
        vec!["echo".to_string(), "ping".to_string()]
    }

    async fn invoke(&self, method: &str, message: Message) -> Result<Message, BoxError> {
        match method {
            "echo" => Ok(message),
            "ping" => Ok(Message::new(json!({ "pong": true }))),
            other => Err(format!("echo service has no method {other}").into()),
        }
    }
}

pub async fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let listener = bind(&args.path)?;
    let mut services = vec![ECHO_SERVICE.to_string()];
    services.extend(args.services.iter().filter(|name| *name != ECHO_SERVICE).cloned());
    let services: Arc<[String]> = services.into();

    print_listening(&args.path.display().to_string(), &services, format);
    tracing::info!(path = %args.path.display(), "serving manager");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|err| io_error("accept failed", err))?;
                tokio::spawn(serve_connection(stream, services.clone()));
            }
            signal = &mut shutdown => {
                signal.map_err(|err| io_error("signal handler setup failed", err))?;
                tracing::info!("shutting down");
                break;
            }
        }
    }

    if let Err(err) = std::fs::remove_file(&args.path) {
        tracing::warn!(error = %err, "failed removing socket file");
    }
    Ok(SUCCESS)
}

fn bind(path: &Path) -> CliResult<UnixListener> {
    if path.exists() {
        return Err(CliError::new(
            USAGE,
            format!("bind failed: {} already exists", path.display()),
        ));
    }
    UnixListener::bind(path).map_err(|err| io_error("bind failed", err))
}

/// Publish the services on one accepted connection until the peer hangs up.
pub fn manager_for(connection: SharedConnection, services: &[String]) -> LocalManager {
    let manager = LocalManager::new(RpcServer::new(connection));
    let echo = RpcObject::from_service(Arc::new(EchoService));
    for name in services {
        manager.add_service(name.clone(), echo.clone());
    }
    manager
}

async fn serve_connection(stream: UnixStream, services: Arc<[String]>) {
    let connection: SharedConnection = Arc::new(StreamConnection::from_unix(stream));
    let closed = Arc::new(Notify::new());
    let signal = closed.clone();
    connection.on_event(move |ev| {
        if ev.is_closed() {
            signal.notify_one();
        }
        Ok(())
    });

    let manager = manager_for(connection.clone(), &services);
    tracing::debug!("peer connected");
    closed.notified().await;
    tracing::debug!(exported = manager.exported_objects().len(), "peer disconnected");

    if let Err(err) = connection.close().await {
        tracing::warn!(error = %err, "failed closing connection");
    }
}
