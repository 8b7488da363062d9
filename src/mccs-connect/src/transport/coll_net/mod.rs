pub mod config;
pub mod resources;
pub mod transporter;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::channel::{ChannelId, ChannelPeer, ConnType, PeerConnId};
use super::mirror::MirrorError;
use super::setup::TransportConnectError;
use super::transporter::{
    ConnectHandle, ConnectHandleError, TransportConnect, TransporterError, CONNECT_HANDLE_SIZE,
};
use crate::bootstrap::{Bootstrap, BootstrapError};
use crate::comm::topo::TopoGraph;
use crate::comm::Communicator;

pub const MAX_LOCAL_RANKS: usize = 64;

// Tag of the reply the recv master hands to the send master of its node
const HANDOFF_TAG_BASE: u32 = 0x7e00_0000;

#[derive(Debug, Error)]
pub enum CollNetTransportError {
    #[error("Collective network is disabled")]
    Disabled,
    #[error("Invalid collective network handle at index {0}")]
    InvalidHandle(usize),
    #[error("Shared buffer {0} not found")]
    BufferNotFound(u64),
    #[error("Resources do not belong to the {0} side")]
    ResourcesMismatch(&'static str),
    #[error("Connect handle error: {0}")]
    ConnectHandle(#[from] ConnectHandleError),
}

#[derive(Debug, Error)]
enum CollNetSetupError {
    #[error("Collective network was disabled by an earlier check")]
    Disabled,
    #[error("No collective network transport is registered")]
    NoTransport,
    #[error("Channel {0} has no collective network root")]
    NoRoot(ChannelId),
    #[error("Root connection {0:?} is already connected")]
    AlreadyConnected(PeerConnId),
    #[error("Root connection {0:?} was not set up")]
    NotSetUp(PeerConnId),
    #[error("Found {0} node masters instead of {1}")]
    MasterCount(usize, usize),
    #[error("Transport error: {0}")]
    Transporter(#[source] TransporterError),
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("Device mirror error: {0}")]
    Mirror(#[from] MirrorError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CollNetDirection {
    Recv = 0,
    Send = 1,
}

impl CollNetDirection {
    // connection slot on the root peer
    #[inline]
    pub fn slot(self) -> u32 {
        self as u32
    }

    #[inline]
    pub fn conn_type(self) -> ConnType {
        match self {
            CollNetDirection::Recv => ConnType::Recv,
            CollNetDirection::Send => ConnType::Send,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollNetSetup {
    Success,
    Fail,
}

/// Collective network root of one channel, shared by the local ranks of a node.
///
/// Every local rank attaches once; the detachment that brings the count to zero
/// owns the release of the root connectors.
pub struct SharedRootPeer {
    ref_count: AtomicUsize,
    peer: Mutex<ChannelPeer>,
}

impl SharedRootPeer {
    pub fn new() -> Arc<Self> {
        Arc::new(SharedRootPeer {
            ref_count: AtomicUsize::new(0),
            peer: Mutex::new(ChannelPeer::new()),
        })
    }

    pub fn attach(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    // Returns true for the last detachment
    pub fn detach(&self) -> bool {
        let prev = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or(0);
        prev == 1
    }

    #[inline]
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn lock(&self) -> MutexGuard<'_, ChannelPeer> {
        self.peer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Free every slot holding resources, returns how many were freed
    pub fn release_connectors(
        &self,
        root_rank: usize,
        channel: ChannelId,
    ) -> Result<usize, TransporterError> {
        let mut guard = self.lock();
        let peer = &mut *guard;
        let mut released = 0;
        for (conn_type, connectors) in [
            (ConnType::Send, &mut peer.send),
            (ConnType::Recv, &mut peer.recv),
        ] {
            for (conn_index, connector) in connectors.iter_mut().enumerate() {
                let conn_id = PeerConnId {
                    peer_rank: root_rank,
                    channel,
                    conn_index: conn_index as u32,
                    conn_type,
                };
                if connector.release(&conn_id)? {
                    released += 1;
                }
            }
        }
        Ok(released)
    }
}

// is_master word followed by the handle
const ALL_CONNECT_SIZE: usize = std::mem::size_of::<u64>() + CONNECT_HANDLE_SIZE;

impl Communicator {
    fn coll_net_conn_id(&self, channel: ChannelId, direction: CollNetDirection) -> PeerConnId {
        PeerConnId {
            peer_rank: self.coll_net_root_rank(),
            channel,
            conn_index: direction.slot(),
            conn_type: direction.conn_type(),
        }
    }

    // Master only: run the transport setup on the root slot
    fn coll_net_local_setup(
        &self,
        graph: Option<&TopoGraph>,
        conn_id: PeerConnId,
    ) -> Result<ConnectHandle, CollNetSetupError> {
        if self.coll_net_disabled {
            return Err(CollNetSetupError::Disabled);
        }
        let (transport_idx, transporter) = self
            .transports
            .coll_net()
            .ok_or(CollNetSetupError::NoTransport)?;
        let root = self
            .channels
            .get(conn_id.channel.0 as usize)
            .and_then(|c| c.coll_net_root.as_ref())
            .ok_or(CollNetSetupError::NoRoot(conn_id.channel))?;

        let mut guard = root.lock();
        let connector = guard
            .connector_mut(conn_id.conn_type, conn_id.conn_index)
            .ok_or(CollNetSetupError::NotSetUp(conn_id))?;
        if connector.is_connected() {
            return Err(CollNetSetupError::AlreadyConnected(conn_id));
        }
        let ctx = self.transport_context(graph);
        let my_info = &self.peers_info[self.rank];
        let root_info = &self.peers_info[conn_id.peer_rank];
        let setup = match conn_id.conn_type {
            ConnType::Send => transporter.send_setup(&ctx, &conn_id, my_info, root_info),
            ConnType::Recv => transporter.recv_setup(&ctx, &conn_id, my_info, root_info),
        }
        .map_err(CollNetSetupError::Transporter)?;
        connector
            .assign(&conn_id, Arc::clone(transporter), transport_idx, setup.resources)
            .map_err(CollNetSetupError::Transporter)?;
        Ok(setup.handle)
    }

    // Master only: connect the root slot with the handles of every node master
    async fn coll_net_local_connect(
        &self,
        graph: Option<&TopoGraph>,
        conn_id: PeerConnId,
        master_connects: &mut [ConnectHandle],
        origin: usize,
    ) -> Result<(), CollNetSetupError> {
        let (_, transporter) = self
            .transports
            .coll_net()
            .ok_or(CollNetSetupError::NoTransport)?;
        let transporter = Arc::clone(transporter);
        let root = self
            .channels
            .get(conn_id.channel.0 as usize)
            .and_then(|c| c.coll_net_root.clone())
            .ok_or(CollNetSetupError::NoRoot(conn_id.channel))?;
        let ctx = self.transport_context(graph);
        loop {
            let connected = {
                let mut guard = root.lock();
                let connector = guard
                    .connector_mut(conn_id.conn_type, conn_id.conn_index)
                    .ok_or(CollNetSetupError::NotSetUp(conn_id))?;
                let resources = connector
                    .resources_mut()
                    .ok_or(CollNetSetupError::NotSetUp(conn_id))?;
                let connect = match conn_id.conn_type {
                    ConnType::Send => {
                        transporter.send_connect(&ctx, &conn_id, master_connects, origin, resources)
                    }
                    ConnType::Recv => {
                        transporter.recv_connect(&ctx, &conn_id, master_connects, origin, resources)
                    }
                }
                .map_err(CollNetSetupError::Transporter)?;
                match connect {
                    TransportConnect::Connected(conn_info) => {
                        connector.mark_connected(conn_info);
                        self.dev_mirror.publish(conn_id, connector.conn_info)?;
                        true
                    }
                    TransportConnect::InProgress => false,
                }
            };
            if connected {
                break;
            }
            smol::future::yield_now().await;
        }
        self.dev_mirror.synchronize().await?;
        Ok(())
    }

    async fn try_setup_coll_net(
        &self,
        channel: ChannelId,
        graph: Option<&TopoGraph>,
        master_rank: usize,
        direction: CollNetDirection,
        connect: &mut ConnectHandle,
    ) -> Result<(), CollNetSetupError> {
        let is_master = self.rank == master_rank;
        let conn_id = self.coll_net_conn_id(channel, direction);

        let mut local = if is_master {
            self.coll_net_local_setup(graph, conn_id).map(Some)
        } else {
            Ok(None)
        };

        let mut master_connects = vec![ConnectHandle::zeroed(); self.num_nodes];
        let origin = match direction {
            CollNetDirection::Recv => {
                // every rank joins, a master that failed its setup advertises itself as non-master
                let mut all_connects = vec![0u8; ALL_CONNECT_SIZE * self.num_ranks];
                let mine = &mut all_connects
                    [self.rank * ALL_CONNECT_SIZE..(self.rank + 1) * ALL_CONNECT_SIZE];
                if let Ok(Some(handle)) = &local {
                    LittleEndian::write_u64(&mut mine[..8], 1);
                    mine[8..].copy_from_slice(handle.as_bytes());
                }
                self.bootstrap.all_gather(&mut all_connects).await?;

                // one master per node, its handle lands in the slot of its node
                let mut filled = vec![false; self.num_nodes];
                let mut num_masters = 0;
                let mut duplicate = false;
                for (rank, entry) in all_connects.chunks_exact(ALL_CONNECT_SIZE).enumerate() {
                    if LittleEndian::read_u64(&entry[..8]) == 0 {
                        continue;
                    }
                    num_masters += 1;
                    let node = self.peers_info[rank].node;
                    match filled.get_mut(node) {
                        Some(seen) if !*seen => {
                            *seen = true;
                            master_connects[node].0.copy_from_slice(&entry[8..]);
                        }
                        _ => duplicate = true,
                    }
                }
                let complete = !duplicate && filled.iter().all(|&seen| seen);
                if local.is_ok() && is_master && !complete {
                    local = Err(CollNetSetupError::MasterCount(num_masters, self.num_nodes));
                }
                self.node
            }
            CollNetDirection::Send => {
                if is_master {
                    master_connects[self.node] = connect.clone();
                }
                self.node
            }
        };

        if local?.is_none() {
            return Ok(());
        }
        log::info!(
            "CollNet {:02} : {} [{}] via {}",
            channel.0,
            self.rank,
            conn_id.conn_type,
            self.transports.coll_net().map_or("?", |(_, t)| t.name())
        );
        self.coll_net_local_connect(graph, conn_id, &mut master_connects, origin)
            .await?;
        if direction == CollNetDirection::Recv {
            *connect = master_connects[origin].clone();
        }
        Ok(())
    }

    /// Build one direction of the collective network path on `channel`.
    ///
    /// Every rank of the communicator must call this for the recv direction since the
    /// master handles are all-gathered. Only `master_rank` touches the shared root.
    /// For recv the master returns the reply for the send master in `connect`; for send
    /// `connect` must carry that reply on the master. Failures never propagate, they
    /// are logged and reported as `CollNetSetup::Fail`.
    pub async fn setup_coll_net(
        &self,
        channel: ChannelId,
        graph: Option<&TopoGraph>,
        master_rank: usize,
        master_peer: usize,
        direction: CollNetDirection,
        connect: &mut ConnectHandle,
    ) -> CollNetSetup {
        match self
            .try_setup_coll_net(channel, graph, master_rank, direction, connect)
            .await
        {
            Ok(()) => CollNetSetup::Success,
            Err(err) => {
                log::warn!(
                    "Rank {}: CollNet {:?} setup on channel {} (master {}, peer {}) failed: {}",
                    self.rank,
                    direction,
                    channel,
                    master_rank,
                    master_peer,
                    err
                );
                CollNetSetup::Fail
            }
        }
    }

    // Returns whether any local rank failed;
    // on failure the collective network stays disabled for this communicator
    pub async fn check_coll_net(&mut self, setup_failed: bool) -> Result<bool, TransportConnectError> {
        let num_local_ranks = self.num_local_ranks();
        if num_local_ranks > MAX_LOCAL_RANKS {
            return Err(TransportConnectError::TooManyLocalRanks(num_local_ranks));
        }
        let word = std::mem::size_of::<i32>();
        let mut failures = vec![0u8; num_local_ranks * word];
        LittleEndian::write_i32(
            &mut failures[self.local_rank * word..(self.local_rank + 1) * word],
            setup_failed as i32,
        );
        self.bootstrap
            .intra_node_all_gather(&self.local_rank_to_rank, self.local_rank, &mut failures)
            .await?;
        let failed = failures
            .chunks_exact(word)
            .any(|flag| LittleEndian::read_i32(flag) != 0);
        if failed {
            if self.local_rank == 0 {
                log::warn!("Cannot initialize CollNet, using point-to-point network instead");
            }
            self.coll_net_disabled = true;
        }
        Ok(failed)
    }

    // Cluster-wide verdict so that every node takes the same path
    pub async fn agree_coll_net(&mut self, node_failed: bool) -> Result<bool, TransportConnectError> {
        let mut verdicts = vec![0u8; self.num_ranks];
        verdicts[self.rank] = node_failed as u8;
        self.bootstrap.all_gather(&mut verdicts).await?;
        let failed = verdicts.iter().any(|&v| v != 0);
        if failed {
            self.coll_net_disabled = true;
        }
        Ok(failed)
    }

    // Recv setup, hand-off of the recv master's reply, then send setup
    pub async fn connect_coll_net_channel(
        &self,
        channel: ChannelId,
        graph: Option<&TopoGraph>,
        recv_master: usize,
        send_master: usize,
    ) -> CollNetSetup {
        let mut connect = ConnectHandle::zeroed();
        let recv = self
            .setup_coll_net(
                channel,
                graph,
                recv_master,
                send_master,
                CollNetDirection::Recv,
                &mut connect,
            )
            .await;
        if recv_master != send_master {
            let tag = HANDOFF_TAG_BASE + channel.0;
            let handoff = if self.rank == recv_master {
                self.bootstrap.send(send_master, tag, connect.as_bytes()).await
            } else if self.rank == send_master {
                self.bootstrap.recv(recv_master, tag, &mut connect.0).await
            } else {
                Ok(())
            };
            if let Err(err) = handoff {
                log::warn!(
                    "Rank {}: CollNet hand-off on channel {} failed: {}",
                    self.rank,
                    channel,
                    err
                );
                return CollNetSetup::Fail;
            }
        }
        let send = self
            .setup_coll_net(
                channel,
                graph,
                send_master,
                recv_master,
                CollNetDirection::Send,
                &mut connect,
            )
            .await;
        if recv == CollNetSetup::Success && send == CollNetSetup::Success {
            CollNetSetup::Success
        } else {
            CollNetSetup::Fail
        }
    }

    // Detach from the root of `channel`, returns whether this call freed the root connectors
    pub fn teardown_coll_net(&mut self, channel: ChannelId) -> Result<bool, TransportConnectError> {
        let root_rank = self.coll_net_root_rank();
        let root = match self
            .channels
            .get_mut(channel.0 as usize)
            .ok_or(TransportConnectError::ChannelNotFound(channel))?
            .coll_net_root
            .take()
        {
            Some(root) => root,
            None => return Ok(false),
        };
        let released = if root.detach() {
            let freed = root.release_connectors(root_rank, channel).map_err(|err| {
                let name = self.transports.coll_net().map_or("COLLNET", |(_, t)| t.name());
                TransportConnectError::Transporter(self.rank, root_rank, name, err)
            })?;
            log::debug!(
                "Rank {}: released {} CollNet connectors of channel {}",
                self.rank,
                freed,
                channel
            );
            true
        } else {
            false
        };
        self.catalog.prune_root_peers();
        Ok(released)
    }

    pub fn teardown_all_coll_net(&mut self) -> Result<usize, TransportConnectError> {
        let mut released = 0;
        for idx in 0..self.channels.len() {
            if self.teardown_coll_net(ChannelId(idx as u32))? {
                released += 1;
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_detach_owns_the_release() {
        let root = SharedRootPeer::new();
        for _ in 0..3 {
            root.attach();
        }
        let released: Vec<bool> = (0..3).map(|_| root.detach()).collect();
        assert_eq!(released, vec![false, false, true]);
        assert_eq!(root.ref_count(), 0);
        assert!(!root.detach());
        assert_eq!(root.ref_count(), 0);
    }

    #[test]
    fn direction_maps_to_slot() {
        assert_eq!(CollNetDirection::Recv.slot(), 0);
        assert_eq!(CollNetDirection::Send.slot(), 1);
        assert_eq!(CollNetDirection::Send.conn_type(), ConnType::Send);
    }

    #[test]
    fn empty_root_releases_nothing() {
        let root = SharedRootPeer::new();
        assert_eq!(root.release_connectors(4, ChannelId(0)).unwrap(), 0);
    }
}
