use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender};
use dashmap::DashMap;
use thiserror::Error;

use super::channel::PeerConnId;
use super::connector::ConnDescriptor;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Mirror stream of rank {0} is closed")]
    StreamClosed(usize),
    #[error("Fail to spawn mirror stream: {0}")]
    Spawn(#[from] std::io::Error),
}

enum StreamOp {
    Copy(PeerConnId, ConnDescriptor),
    Fence(smol::channel::Sender<()>),
}

/// Device-visible copies of the connection descriptors of one rank.
///
/// Copies are queued on a rank-owned stream in submission order. They become
/// visible to `get` only when a later `synchronize` joins them.
pub struct DeviceMirror {
    rank: usize,
    stream: Option<Sender<StreamOp>>,
    worker: Option<JoinHandle<()>>,
    slots: Arc<DashMap<PeerConnId, ConnDescriptor>>,
}

impl DeviceMirror {
    pub fn new(rank: usize) -> Result<Self, MirrorError> {
        let (tx, rx) = crossbeam::channel::unbounded();
        let slots = Arc::new(DashMap::new());
        let worker_slots = Arc::clone(&slots);
        let worker = std::thread::Builder::new()
            .name(format!("mirror-stream-{}", rank))
            .spawn(move || stream_loop(rx, worker_slots))?;
        Ok(DeviceMirror {
            rank,
            stream: Some(tx),
            worker: Some(worker),
            slots,
        })
    }

    pub fn publish(&self, conn_id: PeerConnId, desc: ConnDescriptor) -> Result<(), MirrorError> {
        let stream = self.stream.as_ref().ok_or(MirrorError::StreamClosed(self.rank))?;
        stream
            .send(StreamOp::Copy(conn_id, desc))
            .map_err(|_| MirrorError::StreamClosed(self.rank))
    }

    pub async fn synchronize(&self) -> Result<(), MirrorError> {
        let stream = self.stream.as_ref().ok_or(MirrorError::StreamClosed(self.rank))?;
        let (tx, rx) = smol::channel::bounded(1);
        stream
            .send(StreamOp::Fence(tx))
            .map_err(|_| MirrorError::StreamClosed(self.rank))?;
        rx.recv()
            .await
            .map_err(|_| MirrorError::StreamClosed(self.rank))
    }

    // Descriptor as seen by the execution layer, as of the last `synchronize`
    pub fn get(&self, conn_id: &PeerConnId) -> Option<ConnDescriptor> {
        self.slots.get(conn_id).map(|desc| *desc)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn stream_loop(rx: Receiver<StreamOp>, slots: Arc<DashMap<PeerConnId, ConnDescriptor>>) {
    let mut queued = Vec::new();
    while let Ok(op) = rx.recv() {
        match op {
            StreamOp::Copy(conn_id, desc) => queued.push((conn_id, desc)),
            StreamOp::Fence(done) => {
                for (conn_id, desc) in queued.drain(..) {
                    slots.insert(conn_id, desc);
                }
                let _ = done.try_send(());
            }
        }
    }
}

impl Drop for DeviceMirror {
    fn drop(&mut self) {
        self.stream.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Mirror stream of rank {} panicked", self.rank);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel::{ChannelId, ConnType};

    fn conn_id(peer_rank: usize) -> PeerConnId {
        PeerConnId {
            peer_rank,
            channel: ChannelId(0),
            conn_index: 0,
            conn_type: ConnType::Send,
        }
    }

    #[test]
    fn synchronize_joins_queued_copies() {
        let mirror = DeviceMirror::new(0).unwrap();
        for peer in 0..16 {
            let desc = ConnDescriptor {
                head: peer as u64,
                ..Default::default()
            };
            mirror.publish(conn_id(peer), desc).unwrap();
        }
        smol::block_on(mirror.synchronize()).unwrap();
        assert_eq!(mirror.len(), 16);
        assert_eq!(mirror.get(&conn_id(7)).unwrap().head, 7);
    }

    #[test]
    fn later_copy_of_a_slot_wins() {
        let mirror = DeviceMirror::new(1).unwrap();
        let first = ConnDescriptor {
            step: 1,
            ..Default::default()
        };
        let second = ConnDescriptor {
            step: 2,
            ..Default::default()
        };
        mirror.publish(conn_id(3), first).unwrap();
        mirror.publish(conn_id(3), second).unwrap();
        smol::block_on(mirror.synchronize()).unwrap();
        assert_eq!(mirror.get(&conn_id(3)).unwrap().step, 2);
    }

    #[test]
    fn copies_stay_hidden_until_joined() {
        let mirror = DeviceMirror::new(2).unwrap();
        let first = ConnDescriptor {
            step: 1,
            ..Default::default()
        };
        let second = ConnDescriptor {
            step: 2,
            ..Default::default()
        };
        mirror.publish(conn_id(5), first).unwrap();
        assert!(mirror.get(&conn_id(5)).is_none());
        smol::block_on(mirror.synchronize()).unwrap();

        mirror.publish(conn_id(5), second).unwrap();
        mirror.publish(conn_id(6), second).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(mirror.get(&conn_id(5)).unwrap().step, 1);
        assert!(mirror.get(&conn_id(6)).is_none());

        smol::block_on(mirror.synchronize()).unwrap();
        assert_eq!(mirror.get(&conn_id(5)).unwrap().step, 2);
        assert_eq!(mirror.len(), 2);
    }
}
