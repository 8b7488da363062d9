use std::collections::VecDeque;

use super::transporter::{ConnectHandle, CONNECT_HANDLE_SIZE};

/// Connect handles exchanged with the peers at one ring distance.
///
/// Local handles are packed recv-first: `recv_channels` handles for the
/// connections we receive from `recv_peer`, then `send_channels` handles for the
/// connections we send to `send_peer`, each group in increasing channel order.
/// After the exchange the buffer holds the peers' handles; where each group
/// starts depends on whether both peers are the same rank.
pub struct PeerHandles {
    pub distance: usize,
    data: Vec<u8>,
    recv_channels: usize,
    send_channels: usize,
    recv_offset: usize,
    send_offset: usize,
}

impl PeerHandles {
    pub fn new(distance: usize, recv_channels: usize, send_channels: usize) -> Self {
        PeerHandles {
            distance,
            data: Vec::with_capacity((recv_channels + send_channels) * CONNECT_HANDLE_SIZE),
            recv_channels,
            send_channels,
            recv_offset: 0,
            send_offset: recv_channels,
        }
    }

    #[inline]
    pub fn recv_channels(&self) -> usize {
        self.recv_channels
    }

    #[inline]
    pub fn send_channels(&self) -> usize {
        self.send_channels
    }

    #[inline]
    pub fn num_handles(&self) -> usize {
        self.data.len() / CONNECT_HANDLE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.recv_channels + self.send_channels == 0
    }

    // all recv handles must be pushed before the first send handle
    pub fn push_recv(&mut self, handle: &ConnectHandle) {
        debug_assert!(self.num_handles() < self.recv_channels);
        self.data.extend_from_slice(handle.as_bytes());
    }

    pub fn push_send(&mut self, handle: &ConnectHandle) {
        debug_assert!(self.num_handles() >= self.recv_channels);
        debug_assert!(self.num_handles() < self.recv_channels + self.send_channels);
        self.data.extend_from_slice(handle.as_bytes());
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.num_handles() == self.recv_channels + self.send_channels
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn recv_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.recv_channels * CONNECT_HANDLE_SIZE]
    }

    pub fn send_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.recv_channels * CONNECT_HANDLE_SIZE..]
    }

    pub fn recv_bytes(&self) -> &[u8] {
        &self.data[..self.recv_channels * CONNECT_HANDLE_SIZE]
    }

    pub fn send_bytes(&self) -> &[u8] {
        &self.data[self.recv_channels * CONNECT_HANDLE_SIZE..]
    }

    // The peer sits at the same distance in both directions and sent back its own
    // recv-first buffer in place of ours: its recv handles pair with our send
    // connections, so our send handles now come first.
    pub fn swap_for_symmetric_peer(&mut self) {
        self.send_offset = 0;
        self.recv_offset = self.send_channels;
    }

    // k-th recv connection of this distance, counted in increasing channel order
    pub fn recv_handle(&self, k: usize) -> ConnectHandle {
        debug_assert!(k < self.recv_channels);
        self.handle_at(self.recv_offset + k)
    }

    // k-th send connection of this distance, counted in increasing channel order
    pub fn send_handle(&self, k: usize) -> ConnectHandle {
        debug_assert!(k < self.send_channels);
        self.handle_at(self.send_offset + k)
    }

    fn handle_at(&self, idx: usize) -> ConnectHandle {
        let mut handle = ConnectHandle::zeroed();
        handle
            .0
            .copy_from_slice(&self.data[idx * CONNECT_HANDLE_SIZE..(idx + 1) * CONNECT_HANDLE_SIZE]);
        handle
    }
}

/// Handles of the distances in the current batch, bounded by the round's peer ceiling.
pub struct RoundBuffer {
    max_peers: usize,
    entries: VecDeque<PeerHandles>,
}

impl RoundBuffer {
    pub fn new(max_peers: usize) -> Self {
        let max_peers = max_peers.max(1);
        RoundBuffer {
            max_peers,
            entries: VecDeque::with_capacity(max_peers),
        }
    }

    #[inline]
    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn push(&mut self, handles: PeerHandles) {
        debug_assert!(self.entries.len() < self.max_peers);
        self.entries.push_back(handles);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.entries.len() == self.max_peers
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerHandles> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
