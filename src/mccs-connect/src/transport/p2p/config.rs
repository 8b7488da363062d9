use serde::{Deserialize, Serialize};

use crate::comm::topo::LinkType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pTransportConfig {
    pub enable: bool,
    // farthest link over which peers access each other's buffers directly
    pub max_level: LinkType,
}

impl Default for P2pTransportConfig {
    fn default() -> Self {
        P2pTransportConfig {
            enable: true,
            max_level: LinkType::Pci,
        }
    }
}
