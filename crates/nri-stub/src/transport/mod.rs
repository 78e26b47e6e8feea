//! Wire transport between plugin and runtime.
//!
//! A single Unix socket is split into logical connections by [`mux`], and
//! each logical connection carries a ttrpc byte stream framed by [`ttrpc`].

pub mod mux;
pub mod ttrpc;

use std::io;

use thiserror::Error;

pub use mux::ConnId;
pub use mux::MuxCodec;
pub use mux::MuxFrame;
pub use mux::PLUGIN_SERVICE_CONN;
pub use mux::RUNTIME_SERVICE_CONN;
pub use ttrpc::MessageType;
pub use ttrpc::StatusCode;
pub use ttrpc::TtrpcCodec;
pub use ttrpc::TtrpcMessage;

/// Errors raised while framing or unframing wire data.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown ttrpc message type {0:#04x}")]
    UnknownMessageType(u8),
}
