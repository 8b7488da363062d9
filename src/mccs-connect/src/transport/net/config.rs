use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetTransportConfig {
    // address receivers listen on, defaults to the address of the rank
    pub listen_addr: Option<IpAddr>,
    pub connect_timeout_ms: u64,
}

impl NetTransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for NetTransportConfig {
    fn default() -> Self {
        NetTransportConfig {
            listen_addr: None,
            connect_timeout_ms: 1000,
        }
    }
}
