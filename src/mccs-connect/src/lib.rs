pub mod bootstrap;
pub mod comm;
pub mod config;
pub mod transport;
pub mod utils;

pub use comm::{CommInitError, Communicator, CommunicatorId, HostIdent, PeerInfo};
pub use transport::coll_net::{CollNetDirection, CollNetSetup};
pub use transport::setup::TransportConnectError;
