//! Message-passing primitives over an abstract bidirectional connection.
//!
//! A [`Message`](base::Message) is a JSON text plus an ordered list of binary
//! blobs. Everything else is layered on the
//! [`Connection`](base::Connection) contract.
//!
//! # Crate Structure
//!
//! - [`base`]: messages, the fan-out handler, buses and in-process pipes
//! - [`frame`]: length-prefixed wire codec and a byte-stream connection
//! - [`rpc`]: request/response calls to named objects
//! - [`mux`]: independent virtual streams over one connection (behind `mux` feature)
//! - [`manager`]: remote object directory (behind `manager` feature)

/// Re-export core types.
pub mod base {
    pub use msgprims_core::*;
}

/// Re-export frame types.
pub mod frame {
    pub use msgprims_frame::*;
}

/// Re-export RPC types.
pub mod rpc {
    pub use msgprims_rpc::*;
}

/// Re-export multiplexer types (requires `mux` feature).
#[cfg(feature = "mux")]
pub mod mux {
    pub use msgprims_mux::*;
}

/// Re-export manager types (requires `manager` feature).
#[cfg(feature = "manager")]
pub mod manager {
    pub use msgprims_manager::*;
}

pub use msgprims_core::{Connection, Message, SharedConnection};
pub use msgprims_rpc::rpc_interface;
