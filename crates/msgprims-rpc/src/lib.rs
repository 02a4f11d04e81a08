//! Request/response remote calls over a msgprims [`Connection`](msgprims_core::Connection).
//!
//! An [`RpcServer`] exports named [`RpcObject`]s on one connection. An
//! [`RpcClient`] on the other side hands out [`RemoteObject`] proxies that
//! turn method calls into `request` envelopes and wait for the matching
//! `response` or `error`.
//!
//! ```text
//! client                                     server
//!   │ {type:"request", id, target, method, params} │
//!   │ ───────────────────────────────────────────▶ │
//!   │ {type:"response", id, result}                │
//!   │ ◀─────────────────────────────────────────── │
//!   │ {type:"error", id, code, error}              │
//! ```
//!
//! Blobs ride along unchanged in both directions.

pub mod client;
pub mod envelope;
pub mod error;
mod macros;
pub mod object;
pub mod server;

pub use client::{ClientConfig, RemoteMethod, RemoteObject, RpcClient};
pub use envelope::{Envelope, ErrorCode};
pub use error::{Result, RpcError};
pub use msgprims_core::Message;
pub use object::{MethodFuture, MethodHandler, RpcObject, RpcService};
pub use server::{RpcServer, WeakRpcServer};
