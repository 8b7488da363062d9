use std::any::Any;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::catalog::TransportCatalog;
use super::channel::PeerConnId;
use super::connector::ConnDescriptor;
use crate::comm::topo::{TopoGraph, TopoSystem};
use crate::comm::{CommProfile, CommunicatorId, PeerInfo};

pub type AnyResources = Box<dyn Any + Send>;
pub type TransporterError = anyhow::Error;

pub const CONNECT_HANDLE_SIZE: usize = 128;

/// Backend specific half of a handshake, exchanged verbatim between ranks.
#[derive(Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct ConnectHandle(pub [u8; CONNECT_HANDLE_SIZE]);

#[derive(Debug, Error)]
pub enum ConnectHandleError {
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Required size {0} exceeds maximum of {}", CONNECT_HANDLE_SIZE)]
    ExceedMaxSize(usize),
}

impl ConnectHandle {
    pub const fn zeroed() -> Self {
        ConnectHandle([0u8; CONNECT_HANDLE_SIZE])
    }

    pub fn serialize_from<T: Serialize>(handle: T) -> Result<Self, ConnectHandleError> {
        let mut serialized = [0u8; CONNECT_HANDLE_SIZE];
        let required_size = bincode::serialized_size(&handle)?;
        if required_size as usize > CONNECT_HANDLE_SIZE {
            return Err(ConnectHandleError::ExceedMaxSize(required_size as usize));
        }
        bincode::serialize_into(serialized.as_mut_slice(), &handle)?;
        Ok(ConnectHandle(serialized))
    }

    pub fn deserialize_to<T: DeserializeOwned>(&self) -> Result<T, ConnectHandleError> {
        let handle = bincode::deserialize::<T>(self.0.as_slice())?;
        Ok(handle)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl Default for ConnectHandle {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl From<&[u8; CONNECT_HANDLE_SIZE]> for ConnectHandle {
    fn from(bytes: &[u8; CONNECT_HANDLE_SIZE]) -> Self {
        ConnectHandle(*bytes)
    }
}

pub struct TransportSetup {
    pub handle: ConnectHandle,
    pub resources: AnyResources,
}

#[derive(Debug)]
pub enum TransportConnect {
    // connection is live, descriptor is ready to be published
    Connected(ConnDescriptor),
    // the transport needs another round before it can complete,
    // `connect` must be invoked again with the same handles
    InProgress,
}

/// Read-only state of the communicator handed to transports.
pub struct TransportContext<'a> {
    pub comm_id: CommunicatorId,
    pub rank: usize,
    pub num_ranks: usize,
    pub profile: &'a CommProfile,
    pub catalog: &'a TransportCatalog,
    pub topo: &'a TopoSystem,
    pub graph: Option<&'a TopoGraph>,
}

impl std::fmt::Debug for dyn Transporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Transporter").field(&self.name()).finish()
    }
}

pub trait Transporter: Send + Sync {
    fn name(&self) -> &'static str;

    #[inline]
    // Determine whether two peers can communicate,
    // must not have side effects
    fn can_connect(
        &self,
        _topo: &TopoSystem,
        _graph: Option<&TopoGraph>,
        _my_info: &PeerInfo,
        _peer_info: &PeerInfo,
        _catalog: &TransportCatalog,
    ) -> bool {
        false
    }

    // Setup sender transport, prepare any sender-side resources
    // and the handle the receiver needs to connect
    fn send_setup(
        &self,
        ctx: &TransportContext,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        peer_info: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError>;

    // Setup receiver transport
    fn recv_setup(
        &self,
        ctx: &TransportContext,
        conn_id: &PeerConnId,
        my_info: &PeerInfo,
        peer_info: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError>;

    // Connect sender transport to receiver,
    // `handles` holds more than one entry only for aggregated collective network connects,
    // `origin` indexes the entry that belongs to this rank
    fn send_connect(
        &self,
        ctx: &TransportContext,
        conn_id: &PeerConnId,
        handles: &mut [ConnectHandle],
        origin: usize,
        resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError>;

    // Connect receiver transport
    fn recv_connect(
        &self,
        ctx: &TransportContext,
        conn_id: &PeerConnId,
        handles: &mut [ConnectHandle],
        origin: usize,
        resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError>;

    // Release resources that were produced by setup/connect
    fn free(&self, _conn_id: &PeerConnId, resources: AnyResources) -> Result<(), TransporterError> {
        drop(resources);
        Ok(())
    }
}
