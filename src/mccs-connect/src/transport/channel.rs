use std::fmt::Display;
use std::sync::Arc;

use super::coll_net::SharedRootPeer;
use super::connector::Connector;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnType {
    Send,
    Recv,
}

impl Display for ConnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnType::Send => f.write_str("send"),
            ConnType::Recv => f.write_str("recv"),
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.to_string().as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PeerConnId {
    pub peer_rank: usize,
    pub channel: ChannelId,
    pub conn_index: u32,
    pub conn_type: ConnType,
}

pub const CHANNEL_MAX_CONNS: usize = 2;

pub struct ChannelPeer {
    // conn_index -> Connector
    pub send: [Connector; CHANNEL_MAX_CONNS],
    // conn_index -> Connector
    pub recv: [Connector; CHANNEL_MAX_CONNS],
}

impl ChannelPeer {
    pub fn new() -> Self {
        ChannelPeer {
            send: std::array::from_fn(|_| Connector::new()),
            recv: std::array::from_fn(|_| Connector::new()),
        }
    }

    pub fn connector(&self, conn_type: ConnType, conn_index: u32) -> Option<&Connector> {
        match conn_type {
            ConnType::Send => self.send.get(conn_index as usize),
            ConnType::Recv => self.recv.get(conn_index as usize),
        }
    }

    pub fn connector_mut(&mut self, conn_type: ConnType, conn_index: u32) -> Option<&mut Connector> {
        match conn_type {
            ConnType::Send => self.send.get_mut(conn_index as usize),
            ConnType::Recv => self.recv.get_mut(conn_index as usize),
        }
    }
}

impl Default for ChannelPeer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CommChannel {
    pub id: ChannelId,
    // peer rank -> ChannelPeer, one entry for every rank
    pub peers: Vec<ChannelPeer>,
    // root of the collective network, shared by the local ranks of a node;
    // detached on teardown
    pub coll_net_root: Option<Arc<SharedRootPeer>>,
}

impl CommChannel {
    pub fn new(id: ChannelId, num_ranks: usize, coll_net_root: Arc<SharedRootPeer>) -> Self {
        CommChannel {
            id,
            peers: (0..num_ranks).map(|_| ChannelPeer::new()).collect(),
            coll_net_root: Some(coll_net_root),
        }
    }
}
