pub mod local;
pub mod tcp;

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::{LocalBootstrap, LocalBootstrapFabric};
pub use tcp::{bootstrap_create_root, bootstrap_root, BootstrapState};

// Tags at or above this value are reserved for collectives built on top of
// point-to-point messages, transport setup tags stay well below it
pub const COLLECTIVE_TAG_BASE: u32 = 0x7f00_0000;
const ALL_GATHER_TAG: u32 = COLLECTIVE_TAG_BASE;
const INTRA_NODE_ALL_GATHER_TAG: u32 = COLLECTIVE_TAG_BASE + 0x0010_0000;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bootstrap root received inconsistent rank count of {0} vs {1}")]
    NumRanksMismatch(usize, usize),
    #[error("Bootstrap root received duplicate check-in from rank {0}")]
    DuplicatedCheckIn(usize),
    #[error("Bootstrap root received incorrect rank number {0}")]
    RankOverflow(usize),
    #[error("Received {0} bytes instead of {1} bytes")]
    RecvSizeMismatch(u32, u32),
    #[error("Peer rank {0} is out of range for {1} ranks")]
    PeerOutOfRange(usize, usize),
    #[error("All-gather buffer of {0} bytes is not divisible among {1} ranks")]
    AllGatherSize(usize, usize),
    #[error("Bootstrap fabric for rank {0} has been shut down")]
    Closed(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapHandle {
    pub addr: SocketAddr,
    pub magic: u64,
}

/// Out-of-band messaging between the ranks of one communicator.
///
/// `send`/`recv` are matched on both ends by peer, tag and size. All operations
/// suspend the caller until data has been exchanged.
#[async_trait]
pub trait Bootstrap: Send + Sync {
    fn rank(&self) -> usize;

    fn num_ranks(&self) -> usize;

    async fn send(&self, peer: usize, tag: u32, data: &[u8]) -> Result<(), BootstrapError>;

    async fn recv(&self, peer: usize, tag: u32, data: &mut [u8]) -> Result<(), BootstrapError>;

    // `data` holds one slice per rank, only the slice of this rank is filled in
    // on entry; every slice is filled in on return
    async fn all_gather(&self, data: &mut [u8]) -> Result<(), BootstrapError> {
        let rank = self.rank();
        let num_ranks = self.num_ranks();
        if data.len() % num_ranks != 0 {
            return Err(BootstrapError::AllGatherSize(data.len(), num_ranks));
        }
        let size = data.len() / num_ranks;
        let next = (rank + 1) % num_ranks;
        let prev = (rank + num_ranks - 1) % num_ranks;
        for i in 0..(num_ranks - 1) {
            let recv_slice_idx = (rank + num_ranks - i - 1) % num_ranks;
            let send_slice_idx = (rank + num_ranks - i) % num_ranks;
            let tag = ALL_GATHER_TAG + i as u32;
            let send_data = data[send_slice_idx * size..(send_slice_idx + 1) * size].to_vec();
            self.send(next, tag, &send_data).await?;
            let recv_data = &mut data[recv_slice_idx * size..(recv_slice_idx + 1) * size];
            self.recv(prev, tag, recv_data).await?;
        }
        log::trace!(
            "Bootstrap AllGather done: rank {} of {}, size: {}",
            rank,
            num_ranks,
            size
        );
        Ok(())
    }

    // ranks: maps ranks of the node to global ranks
    // rank: my index in `ranks`
    async fn intra_node_all_gather(
        &self,
        ranks: &[usize],
        rank: usize,
        data: &mut [u8],
    ) -> Result<(), BootstrapError> {
        let num_ranks = ranks.len();
        if num_ranks <= 1 {
            return Ok(());
        }
        if data.len() % num_ranks != 0 {
            return Err(BootstrapError::AllGatherSize(data.len(), num_ranks));
        }
        let size = data.len() / num_ranks;
        let my_data = data[rank * size..(rank + 1) * size].to_vec();
        for i in 1..num_ranks {
            let src_idx = (rank + num_ranks - i) % num_ranks;
            let dst_idx = (rank + i) % num_ranks;
            let tag = INTRA_NODE_ALL_GATHER_TAG + i as u32;
            self.send(ranks[dst_idx], tag, &my_data).await?;
            let recv_data = &mut data[src_idx * size..(src_idx + 1) * size];
            self.recv(ranks[src_idx], tag, recv_data).await?;
        }
        log::trace!(
            "Bootstrap intra node AllGather done: rank {} of {}, size: {}",
            rank,
            num_ranks,
            size
        );
        Ok(())
    }

    // Dissemination barrier among `ranks`, `rank` is my index in `ranks`
    async fn barrier(&self, ranks: &[usize], rank: usize, tag: u32) -> Result<(), BootstrapError> {
        let num_ranks = ranks.len();
        if num_ranks <= 1 {
            return Ok(());
        }
        let mut data = [0u8; 1];
        let mut mask = 1;
        while mask < num_ranks {
            let src_idx = (rank + num_ranks - mask) % num_ranks;
            let dst_idx = (rank + mask) % num_ranks;
            self.send(ranks[dst_idx], tag, &data).await?;
            self.recv(ranks[src_idx], tag, &mut data).await?;
            mask <<= 1;
        }
        log::trace!("Bootstrap barrier done: rank {} of {}", rank, num_ranks);
        Ok(())
    }
}
