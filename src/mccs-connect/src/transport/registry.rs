use std::sync::Arc;

use super::coll_net::transporter::COLL_NET_TRANSPORTER;
use super::net::transporter::NET_TRANSPORTER;
use super::p2p::transporter::P2P_TRANSPORTER;
use super::shm::transporter::SHM_TRANSPORTER;
use super::transporter::Transporter;

pub const P2P_TRANSPORT_IDX: usize = 0;
pub const SHM_TRANSPORT_IDX: usize = 1;
pub const NET_TRANSPORT_IDX: usize = 2;
pub const COLL_NET_TRANSPORT_IDX: usize = 3;

/// Transports in priority order, the index of a transport is its priority.
#[derive(Clone)]
pub struct TransportRegistry {
    transports: Vec<Arc<dyn Transporter>>,
    coll_net_idx: Option<usize>,
}

impl TransportRegistry {
    pub fn new(transports: Vec<Arc<dyn Transporter>>) -> Self {
        TransportRegistry {
            transports,
            coll_net_idx: None,
        }
    }

    // P2P, SHM, NET, then the collective network
    pub fn builtin() -> Self {
        let transports: Vec<Arc<dyn Transporter>> = vec![
            Arc::new(P2P_TRANSPORTER),
            Arc::new(SHM_TRANSPORTER),
            Arc::new(NET_TRANSPORTER),
            Arc::new(COLL_NET_TRANSPORTER),
        ];
        TransportRegistry {
            transports,
            coll_net_idx: Some(COLL_NET_TRANSPORT_IDX),
        }
    }

    // Appends the collective network transport with the lowest priority
    pub fn with_coll_net(mut self, transporter: Arc<dyn Transporter>) -> Self {
        self.transports.push(transporter);
        self.coll_net_idx = Some(self.transports.len() - 1);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Arc<dyn Transporter>)> {
        self.transports.iter().enumerate()
    }

    pub fn get(&self, idx: usize) -> Option<&Arc<dyn Transporter>> {
        self.transports.get(idx)
    }

    pub fn coll_net(&self) -> Option<(usize, &Arc<dyn Transporter>)> {
        let idx = self.coll_net_idx?;
        Some((idx, &self.transports[idx]))
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
