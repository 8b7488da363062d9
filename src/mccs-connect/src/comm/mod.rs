pub mod topo;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use thiserror::Error;

use crate::bootstrap::Bootstrap;
use crate::config::ConnectConfig;
use crate::transport::catalog::TransportCatalog;
use crate::transport::channel::{ChannelId, CommChannel, ConnType, PeerConnId};
use crate::transport::connector::Connector;
use crate::transport::intent::ConnectIntents;
use crate::transport::mirror::{DeviceMirror, MirrorError};
use crate::transport::registry::TransportRegistry;
use crate::transport::{DEFAULT_BUFFER_SIZE, MAX_CHANNELS, NUM_PROTOCOLS};
use topo::TopoSystem;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommunicatorId(pub u32);

/// Identity of the host a rank runs on, ranks with equal identities share a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostIdent(pub String);

impl HostIdent {
    pub fn new(name: &str) -> Self {
        HostIdent(name.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub rank: usize,
    pub host: HostIdent,
    // address the network transport advertises for this rank
    pub addr: IpAddr,
    // filled in by the communicator
    pub node: usize,
    pub local_rank: usize,
    pub cuda_device_idx: i32,
    pub bus_id: i64,
}

impl PeerInfo {
    pub fn new(rank: usize, host: HostIdent, addr: IpAddr) -> Self {
        PeerInfo {
            rank,
            host,
            addr,
            node: 0,
            local_rank: 0,
            cuda_device_idx: 0,
            bus_id: rank as i64,
        }
    }
}

// comm profile, setting and
#[derive(Clone, Debug)]
pub struct CommProfile {
    pub buff_sizes: [usize; NUM_PROTOCOLS],
}

impl Default for CommProfile {
    fn default() -> Self {
        CommProfile {
            buff_sizes: [DEFAULT_BUFFER_SIZE; NUM_PROTOCOLS],
        }
    }
}

#[derive(Debug, Error)]
pub enum CommInitError {
    #[error("Rank {0} is out of range for {1} ranks")]
    RankOutOfRange(usize, usize),
    #[error("Peer info at index {0} describes rank {1}")]
    PeerInfoMismatch(usize, usize),
    #[error("Bootstrap serves rank {0} of {1}, communicator expects rank {2} of {3}")]
    BootstrapMismatch(usize, usize, usize, usize),
    #[error("{0} channels exceed the maximum of {}", MAX_CHANNELS)]
    TooManyChannels(usize),
    #[error("Device mirror: {0}")]
    Mirror(#[from] MirrorError),
}

pub struct Communicator {
    pub id: CommunicatorId,
    pub rank: usize,
    pub num_ranks: usize,
    pub node: usize,
    pub num_nodes: usize,
    pub local_rank: usize,
    // local rank -> global rank, for the ranks of my node
    pub local_rank_to_rank: Vec<usize>,
    // one entry per rank, followed by the collective network root
    pub peers_info: Vec<PeerInfo>,
    // channel_id -> CommChannel
    pub channels: Vec<CommChannel>,
    pub profile: CommProfile,
    pub topo: TopoSystem,
    pub bootstrap: Arc<dyn Bootstrap>,
    pub catalog: Arc<TransportCatalog>,
    pub transports: TransportRegistry,
    pub dev_mirror: DeviceMirror,
    pub connect_config: ConnectConfig,
    pub(crate) intents: ConnectIntents,
    pub(crate) coll_net_disabled: bool,
    // drain passes of each round of the last establishment call
    pub(crate) drain_passes: Vec<usize>,
}

impl Communicator {
    pub fn new(
        id: CommunicatorId,
        rank: usize,
        mut peers_info: Vec<PeerInfo>,
        num_channels: usize,
        bootstrap: Arc<dyn Bootstrap>,
        catalog: Arc<TransportCatalog>,
    ) -> Result<Self, CommInitError> {
        let num_ranks = peers_info.len();
        if rank >= num_ranks {
            return Err(CommInitError::RankOutOfRange(rank, num_ranks));
        }
        if bootstrap.rank() != rank || bootstrap.num_ranks() != num_ranks {
            return Err(CommInitError::BootstrapMismatch(
                bootstrap.rank(),
                bootstrap.num_ranks(),
                rank,
                num_ranks,
            ));
        }
        if num_channels > MAX_CHANNELS {
            return Err(CommInitError::TooManyChannels(num_channels));
        }
        for (idx, info) in peers_info.iter().enumerate() {
            if info.rank != idx {
                return Err(CommInitError::PeerInfoMismatch(idx, info.rank));
            }
        }

        // nodes are numbered in order of their first rank
        let mut nodes: HashMap<HostIdent, usize> = HashMap::new();
        let mut node_ranks: Vec<Vec<usize>> = Vec::new();
        for info in peers_info.iter_mut() {
            let next = nodes.len();
            let node = *nodes.entry(info.host.clone()).or_insert(next);
            if node == node_ranks.len() {
                node_ranks.push(Vec::new());
            }
            info.node = node;
            info.local_rank = node_ranks[node].len();
            node_ranks[node].push(info.rank);
        }
        let num_nodes = node_ranks.len();
        let node = peers_info[rank].node;
        let local_rank = peers_info[rank].local_rank;
        let local_rank_to_rank = node_ranks.swap_remove(node);

        let my_host = peers_info[rank].host.clone();
        let mut root_info = PeerInfo::new(
            num_ranks,
            HostIdent::new("coll-net-root"),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        );
        root_info.node = num_nodes;
        root_info.bus_id = -1;
        peers_info.push(root_info);

        let channels = (0..num_channels)
            .map(|idx| {
                let channel = ChannelId(idx as u32);
                let root = catalog.attach_root_peer(id, &my_host, channel);
                CommChannel::new(channel, num_ranks, root)
            })
            .collect();
        let dev_mirror = DeviceMirror::new(rank)?;

        log::debug!(
            "Communicator {:?} rank {}/{}: node {}/{}, local rank {}/{}, {} channels",
            id,
            rank,
            num_ranks,
            node,
            num_nodes,
            local_rank,
            local_rank_to_rank.len(),
            num_channels
        );
        Ok(Communicator {
            id,
            rank,
            num_ranks,
            node,
            num_nodes,
            local_rank,
            local_rank_to_rank,
            peers_info,
            channels,
            profile: CommProfile::default(),
            topo: TopoSystem::new(),
            bootstrap,
            catalog,
            transports: TransportRegistry::builtin(),
            dev_mirror,
            connect_config: ConnectConfig::default(),
            intents: ConnectIntents::new(num_ranks),
            coll_net_disabled: false,
            drain_passes: Vec::new(),
        })
    }

    pub fn with_transports(mut self, transports: TransportRegistry) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_topology(mut self, topo: TopoSystem) -> Self {
        self.topo = topo;
        self
    }

    pub fn with_connect_config(mut self, config: ConnectConfig) -> Self {
        self.connect_config = config;
        self
    }

    pub fn with_profile(mut self, profile: CommProfile) -> Self {
        self.profile = profile;
        self
    }

    #[inline]
    pub fn num_local_ranks(&self) -> usize {
        self.local_rank_to_rank.len()
    }

    // Rank of the collective network root
    #[inline]
    pub fn coll_net_root_rank(&self) -> usize {
        self.num_ranks
    }

    // Connect intents recorded but not yet established
    #[inline]
    pub fn pending_intents(&self) -> &ConnectIntents {
        &self.intents
    }

    #[inline]
    pub fn drain_passes(&self) -> &[usize] {
        &self.drain_passes
    }

    #[inline]
    pub fn coll_net_supported(&self) -> bool {
        !self.coll_net_disabled
    }

    pub fn connector(
        &self,
        channel: ChannelId,
        peer: usize,
        conn_type: ConnType,
        conn_index: u32,
    ) -> Option<&Connector> {
        self.channels
            .get(channel.0 as usize)?
            .peers
            .get(peer)?
            .connector(conn_type, conn_index)
    }

    pub fn is_connected(
        &self,
        channel: ChannelId,
        peer: usize,
        conn_type: ConnType,
        conn_index: u32,
    ) -> bool {
        self.connector(channel, peer, conn_type, conn_index)
            .map_or(false, |c| c.is_connected())
    }

    // Hand every peer connection back to its transport
    pub fn free_peer_connections(&mut self) -> Result<(), crate::transport::TransporterError> {
        for channel in self.channels.iter_mut() {
            for (peer_rank, peer) in channel.peers.iter_mut().enumerate() {
                for (conn_type, connectors) in [
                    (ConnType::Send, &mut peer.send),
                    (ConnType::Recv, &mut peer.recv),
                ] {
                    for (conn_index, connector) in connectors.iter_mut().enumerate() {
                        let conn_id = PeerConnId {
                            peer_rank,
                            channel: channel.id,
                            conn_index: conn_index as u32,
                            conn_type,
                        };
                        connector.release(&conn_id)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if let Err(err) = self.teardown_all_coll_net() {
            log::error!("Rank {}: collective network teardown failed: {}", self.rank, err);
        }
        if let Err(err) = self.free_peer_connections() {
            log::error!("Rank {}: transport free failed: {}", self.rank, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::LocalBootstrapFabric;

    fn peers(hosts: &[&str]) -> Vec<PeerInfo> {
        hosts
            .iter()
            .enumerate()
            .map(|(rank, host)| {
                PeerInfo::new(rank, HostIdent::new(host), IpAddr::V4(Ipv4Addr::LOCALHOST))
            })
            .collect()
    }

    #[test]
    fn nodes_are_numbered_by_first_rank() {
        let fabric = LocalBootstrapFabric::new(5);
        let catalog = Arc::new(TransportCatalog::new());
        let comm = Communicator::new(
            CommunicatorId(7),
            3,
            peers(&["b", "a", "b", "a", "c"]),
            2,
            Arc::new(fabric.endpoint(3)),
            catalog,
        )
        .unwrap();
        assert_eq!(comm.num_nodes, 3);
        assert_eq!(comm.node, 1);
        assert_eq!(comm.local_rank, 1);
        assert_eq!(comm.local_rank_to_rank, vec![1, 3]);
        assert_eq!(comm.peers_info.len(), 6);
        assert_eq!(comm.peers_info[5].rank, comm.coll_net_root_rank());
        assert_eq!(comm.peers_info[4].node, 2);
        assert_eq!(comm.channels.len(), 2);
        assert!(comm.coll_net_supported());
    }

    #[test]
    fn mismatched_bootstrap_is_rejected() {
        let fabric = LocalBootstrapFabric::new(2);
        let catalog = Arc::new(TransportCatalog::new());
        let result = Communicator::new(
            CommunicatorId(0),
            0,
            peers(&["a", "a"]),
            1,
            Arc::new(fabric.endpoint(1)),
            catalog,
        );
        assert!(matches!(result, Err(CommInitError::BootstrapMismatch(1, 2, 0, 2))));
    }
}
