use std::fmt;
use std::io;

use msgprims_core::ConnectionError;
use msgprims_manager::ManagerError;
use msgprims_rpc::RpcError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn connection_error(context: &str, err: ConnectionError) -> CliError {
    match err {
        ConnectionError::Io(source) => io_error(context, source),
        ConnectionError::Closed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn rpc_error(context: &str, err: RpcError) -> CliError {
    match err {
        RpcError::Connection(err) => connection_error(context, err),
        RpcError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        RpcError::ConnectionClosed | RpcError::Remote { .. } => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        RpcError::UnknownType(_)
        | RpcError::UndeclaredMethod { .. }
        | RpcError::InvalidMethodName(_) => CliError::new(USAGE, format!("{context}: {err}")),
        RpcError::Json(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
    }
}

pub fn manager_error(context: &str, err: ManagerError) -> CliError {
    match err {
        ManagerError::Rpc(err) => rpc_error(context, err),
        ManagerError::UnsupportedVersion(_) => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        ManagerError::MalformedReply(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use msgprims_rpc::ErrorCode;

    use super::*;

    #[test]
    fn timeouts_map_to_124() {
        let err = rpc_error("call failed", RpcError::Timeout(Duration::from_secs(1)));
        assert_eq!(err.code, TIMEOUT);
        assert!(err.message.starts_with("call failed: "));
    }

    #[test]
    fn remote_failures_map_to_failure() {
        let err = manager_error(
            "call failed",
            ManagerError::Rpc(RpcError::Remote {
                code: ErrorCode::UnknownMethod,
                message: "Unknown method.".into(),
            }),
        );
        assert_eq!(err.code, FAILURE);
    }

    #[test]
    fn io_errors_keep_their_kind() {
        let err = connection_error(
            "connect failed",
            ConnectionError::Io(io::Error::from(io::ErrorKind::PermissionDenied)),
        );
        assert_eq!(err.code, PERMISSION_DENIED);

        let err = manager_error("handshake failed", ManagerError::UnsupportedVersion(2));
        assert_eq!(err.code, TRANSPORT_ERROR);
    }
}
