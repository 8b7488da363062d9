pub mod config;
pub mod transporter;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum P2pTransportError {
    #[error("Peer buffer {0:#x} of rank {1} is not exported")]
    BufferNotFound(u64, usize),
    #[error("Resources do not belong to a P2P {0} connector")]
    ResourcesMismatch(&'static str),
}
