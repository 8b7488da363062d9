pub mod config;
pub mod resources;
pub mod transporter;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmTransportError {
    #[error("Shared buffer {0:#x} of rank {1} is not exported")]
    BufferNotFound(u64, usize),
    #[error("Resources do not belong to a SHM {0} connector")]
    ResourcesMismatch(&'static str),
}
