pub mod config;
pub mod resources;
pub mod transporter;

use thiserror::Error;

use crate::transport::transporter::ConnectHandleError;

#[derive(Debug, Error)]
pub enum NetTransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connect handle error: {0}")]
    ConnectHandle(#[from] ConnectHandleError),
    #[error("Failed to downcast {0} resources")]
    DowncastResources(&'static str),
    #[error("Peer closed the connection before the handshake completed")]
    HandshakeClosed,
    #[error("Invalid handshake magic {0:#x}, expected {1:#x}")]
    MagicMismatch(u64, u64),
    #[error("No connect handle at index {0}")]
    InvalidHandle(usize),
}
