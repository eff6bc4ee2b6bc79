pub mod client;
pub mod server;

pub use client::PeerClient;
pub use server::{spawn_rpc_server, RaftService, RpcServerConfig, RpcServerHandle};

use thiserror::Error;

/// Frame status bytes on the wire.
pub(crate) const STATUS_OK: u8 = 0;
pub(crate) const STATUS_ERR: u8 = 1;

/// Errors emitted by the peer RPC transport. Transport failures are routine
/// between controllers; callers map them to "no reply", never to a crash.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame length")]
    FrameLength,
    #[error("frame encode failed ({context}): {details}")]
    FrameEncode {
        context: &'static str,
        details: String,
    },
    #[error("frame decode failed ({context}): {details}")]
    FrameDecode {
        context: &'static str,
        details: String,
    },
    #[error("peer answered status {status}: {message:?}")]
    RemoteError { status: u8, message: Option<String> },
    #[error("shutdown timed out ({context})")]
    ShutdownTimeout { context: &'static str },
}
