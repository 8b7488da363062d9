use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use smol::channel::{Receiver, Sender};

use super::{Bootstrap, BootstrapError};

// (source rank, destination rank, tag)
type MailboxKey = (usize, usize, u32);

struct Mailbox {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// In-process bootstrap fabric shared by ranks that live in one process,
/// e.g. simulated ranks of the CLI and multi-rank tests.
pub struct LocalBootstrapFabric {
    num_ranks: usize,
    mailboxes: DashMap<MailboxKey, Mailbox>,
}

impl LocalBootstrapFabric {
    pub fn new(num_ranks: usize) -> Arc<Self> {
        Arc::new(LocalBootstrapFabric {
            num_ranks,
            mailboxes: DashMap::new(),
        })
    }

    pub fn endpoint(self: &Arc<Self>, rank: usize) -> LocalBootstrap {
        LocalBootstrap {
            fabric: Arc::clone(self),
            rank,
        }
    }

    pub fn endpoints(self: &Arc<Self>) -> Vec<LocalBootstrap> {
        (0..self.num_ranks).map(|r| self.endpoint(r)).collect()
    }

    fn sender(&self, key: MailboxKey) -> Sender<Vec<u8>> {
        self.mailbox(key, |m| m.tx.clone())
    }

    fn receiver(&self, key: MailboxKey) -> Receiver<Vec<u8>> {
        self.mailbox(key, |m| m.rx.clone())
    }

    fn mailbox<T, F: FnOnce(&Mailbox) -> T>(&self, key: MailboxKey, f: F) -> T {
        let entry = self.mailboxes.entry(key).or_insert_with(|| {
            let (tx, rx) = smol::channel::unbounded();
            Mailbox { tx, rx }
        });
        f(entry.value())
    }
}

pub struct LocalBootstrap {
    fabric: Arc<LocalBootstrapFabric>,
    rank: usize,
}

#[async_trait]
impl Bootstrap for LocalBootstrap {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.fabric.num_ranks
    }

    async fn send(&self, peer: usize, tag: u32, data: &[u8]) -> Result<(), BootstrapError> {
        if peer >= self.fabric.num_ranks {
            return Err(BootstrapError::PeerOutOfRange(peer, self.fabric.num_ranks));
        }
        log::trace!(
            "Local bootstrap rank {} send {} bytes to peer {} tag {}",
            self.rank,
            data.len(),
            peer,
            tag
        );
        let tx = self.fabric.sender((self.rank, peer, tag));
        tx.send(data.to_vec())
            .await
            .map_err(|_| BootstrapError::Closed(peer))
    }

    async fn recv(&self, peer: usize, tag: u32, data: &mut [u8]) -> Result<(), BootstrapError> {
        if peer >= self.fabric.num_ranks {
            return Err(BootstrapError::PeerOutOfRange(peer, self.fabric.num_ranks));
        }
        let rx = self.fabric.receiver((peer, self.rank, tag));
        let message = rx.recv().await.map_err(|_| BootstrapError::Closed(peer))?;
        if message.len() != data.len() {
            return Err(BootstrapError::RecvSizeMismatch(
                message.len() as u32,
                data.len() as u32,
            ));
        }
        data.copy_from_slice(&message);
        log::trace!(
            "Local bootstrap rank {} recv {} bytes from peer {} tag {}",
            self.rank,
            data.len(),
            peer,
            tag
        );
        Ok(())
    }
}
