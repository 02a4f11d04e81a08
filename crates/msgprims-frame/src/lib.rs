//! Length-prefixed wire framing for msgprims messages.
//!
//! Every message is framed as big-endian 32-bit integers followed by the raw
//! parts:
//! - part count (text plus one per blob)
//! - one length per part
//! - the compact JSON text, then each blob in order
//!
//! [`StreamConnection`] runs this codec over any async byte stream and exposes
//! it as a [`Connection`](msgprims_core::Connection).

pub mod codec;
pub mod error;
pub mod stream;

pub use codec::{
    decode_message, encode_message, encoded_len, FrameConfig, MessageCodec, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_MAX_PARTS, LENGTH_SIZE,
};
pub use error::{FrameError, Result};
pub use stream::StreamConnection;
