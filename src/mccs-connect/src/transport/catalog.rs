use std::any::Any;
use std::sync::Arc;

use dashmap::mapref::one::MappedRef;
use dashmap::DashMap;
use thiserror::Error;

use super::channel::ChannelId;
use super::coll_net::SharedRootPeer;
use crate::comm::{CommunicatorId, HostIdent};

pub type AnyConfig = Box<dyn Any + Send + Sync>;
pub type ConfigRef<'a, T> = MappedRef<'a, String, AnyConfig, T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Fail to downcast config {0} to a concrete type")]
    Downcast(String),
    #[error("Config {0} not found")]
    NotFound(String),
}

type RootPeerKey = (CommunicatorId, HostIdent, ChannelId);

/// Process-wide transport state: per-transport configs,
/// and collective network root peers shared by the local ranks of a communicator.
pub struct TransportCatalog {
    config: DashMap<String, AnyConfig>,
    root_peers: DashMap<RootPeerKey, Arc<SharedRootPeer>>,
}

impl TransportCatalog {
    pub fn new() -> Self {
        TransportCatalog {
            config: DashMap::new(),
            root_peers: DashMap::new(),
        }
    }
}

impl Default for TransportCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportCatalog {
    pub fn register_config<T>(&self, name: String, config: T)
    where
        T: Any + Send + Sync,
    {
        let boxed = Box::new(config);
        self.config.insert(name, boxed);
    }

    pub fn remove_config(&self, name: &str) {
        self.config.remove(name);
    }

    pub fn get_config<T>(&self, name: &str) -> Result<ConfigRef<T>, Error>
    where
        T: Any + Send + Sync,
    {
        let entry = self
            .config
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        entry
            .try_map(|x| x.downcast_ref::<T>())
            .map_err(|_| Error::Downcast(name.to_string()))
    }

    // Registered config, or the default when the process never registered one
    pub fn config_or_default<T>(&self, name: &str) -> T
    where
        T: Any + Send + Sync + Clone + Default,
    {
        match self.get_config::<T>(name) {
            Ok(config) => config.clone(),
            Err(_) => T::default(),
        }
    }

    // Attach one more local rank to the root peer of a channel
    pub fn attach_root_peer(
        &self,
        comm_id: CommunicatorId,
        host: &HostIdent,
        channel: ChannelId,
    ) -> Arc<SharedRootPeer> {
        let root = self
            .root_peers
            .entry((comm_id, host.clone(), channel))
            .or_insert_with(SharedRootPeer::new)
            .clone();
        root.attach();
        root
    }

    // Forget root peers that every local rank detached from
    pub fn prune_root_peers(&self) {
        self.root_peers.retain(|_, root| root.ref_count() > 0);
    }
}
