use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::transport::catalog::TransportCatalog;
use crate::transport::coll_net::config::CollNetConfig;
use crate::transport::net::config::NetTransportConfig;
use crate::transport::p2p::config::P2pTransportConfig;
use crate::transport::shm::config::ShmTransportConfig;
use crate::transport::NUM_PROTOCOLS;

pub const ENV_ROUND_MAX_PEERS: &str = "MCCS_CONNECT_ROUND_MAX_PEERS";
pub const ENV_REPORT_CONNECT_PROGRESS: &str = "MCCS_REPORT_CONNECT_PROGRESS";
pub const ENV_COLLNET_ENABLE: &str = "MCCS_COLLNET_ENABLE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    // peers whose handles are buffered before a round is drained
    pub round_max_peers: usize,
    pub report_progress: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        ConnectConfig {
            round_max_peers: 128,
            report_progress: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultCommConfig {
    #[serde(rename = "buffer_sizes")]
    pub buf_sizes: [usize; NUM_PROTOCOLS],
    pub channel_count: u32,
}

impl Default for DefaultCommConfig {
    fn default() -> Self {
        DefaultCommConfig {
            // 4MB
            buf_sizes: [1 << 22],
            channel_count: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommGlobalConfig {
    #[serde(rename = "p2p", default)]
    pub p2p_config: P2pTransportConfig,
    #[serde(rename = "shm", default)]
    pub shm_config: ShmTransportConfig,
    #[serde(rename = "net", default)]
    pub net_config: NetTransportConfig,
    #[serde(rename = "coll_net", default)]
    pub coll_net_config: CollNetConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub comm_global_config: CommGlobalConfig,
    #[serde(default)]
    pub comm_default_config: DefaultCommConfig,
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    // `lookup` maps a variable name to its value, if set
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_ROUND_MAX_PEERS) {
            let max_peers: usize = value.trim().parse().map_err(|err| {
                anyhow::anyhow!("invalid {}={:?}: {}", ENV_ROUND_MAX_PEERS, value, err)
            })?;
            self.connect.round_max_peers = max_peers.max(1);
        }
        if let Some(value) = lookup(ENV_REPORT_CONNECT_PROGRESS) {
            self.connect.report_progress = parse_flag(ENV_REPORT_CONNECT_PROGRESS, &value)?;
        }
        if let Some(value) = lookup(ENV_COLLNET_ENABLE) {
            self.comm_global_config.coll_net_config.enable =
                parse_flag(ENV_COLLNET_ENABLE, &value)?;
        }
        Ok(())
    }

    // Publish backend configs to the transports of this process
    pub fn register_transport_configs(&self, catalog: &TransportCatalog) {
        let global = &self.comm_global_config;
        catalog.register_config(String::from("P2pTransport"), global.p2p_config.clone());
        catalog.register_config(String::from("ShmTransport"), global.shm_config.clone());
        catalog.register_config(String::from("NetTransport"), global.net_config.clone());
        catalog.register_config(String::from("CollNetTransport"), global.coll_net_config.clone());
    }
}

fn parse_flag(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => anyhow::bail!("invalid {}={:?}, expected 0 or 1", key, other),
    }
}
