pub mod buffer;
pub mod catalog;
pub mod channel;
pub mod coll_net;
pub mod connector;
pub mod handles;
pub mod intent;
pub mod meta;
pub mod mirror;
pub mod net;
pub mod p2p;
pub mod progress;
pub mod registry;
pub mod setup;
pub mod shm;
pub mod transporter;

pub use transporter::TransporterError;

pub const NUM_BUFFER_SLOTS: usize = 8;
pub const NUM_PROTOCOLS: usize = 1;

pub const DEFAULT_BUFFER_SIZE: usize = 1 << 22;

// one intent bit per channel
pub const MAX_CHANNELS: usize = 64;
