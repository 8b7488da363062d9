use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::PeerInfo;

/// Kind of path between two ranks, ordered from closest to farthest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    // same device
    Loc,
    NvLink,
    // through a PCIe switch or host bridge
    Pci,
    // across the CPU interconnect
    Sys,
    Net,
}

/// Paths between ranks, as produced by topology discovery.
#[derive(Clone, Debug, Default)]
pub struct TopoSystem {
    links: HashMap<(usize, usize), LinkType>,
}

impl TopoSystem {
    pub fn new() -> Self {
        TopoSystem {
            links: HashMap::new(),
        }
    }

    pub fn set_link(&mut self, rank_a: usize, rank_b: usize, link: LinkType) {
        self.links.insert((rank_a, rank_b), link);
        self.links.insert((rank_b, rank_a), link);
    }

    // Ranks without an explicit link are connected through PCIe on the same host,
    // or through the network otherwise
    pub fn link(&self, my_info: &PeerInfo, peer_info: &PeerInfo) -> LinkType {
        if let Some(link) = self.links.get(&(my_info.rank, peer_info.rank)) {
            return *link;
        }
        if my_info.rank == peer_info.rank {
            LinkType::Loc
        } else if my_info.host == peer_info.host {
            LinkType::Pci
        } else {
            LinkType::Net
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphPattern {
    Ring,
    Tree,
    CollNet,
}

/// Channel layout a set of connections is built for.
#[derive(Clone, Debug)]
pub struct TopoGraph {
    // below 127, tags are derived from it
    pub id: u8,
    pub pattern: GraphPattern,
    // farthest link the graph allows direct peer access over
    pub p2p_level: Option<LinkType>,
}

impl TopoGraph {
    pub fn new(id: u8, pattern: GraphPattern) -> Self {
        debug_assert!(id < 127);
        TopoGraph {
            id,
            pattern,
            p2p_level: None,
        }
    }
}

#[inline]
pub fn graph_tag(graph: Option<&TopoGraph>) -> u32 {
    graph.map_or(0, |g| g.id as u32 + 1)
}
