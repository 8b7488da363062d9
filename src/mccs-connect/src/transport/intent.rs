use thiserror::Error;

use super::channel::{ChannelId, ConnType};
use super::MAX_CHANNELS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntentError {
    #[error("Channel {0} exceeds the maximum of {} channels", MAX_CHANNELS)]
    ChannelOutOfRange(ChannelId),
    #[error("Connection index mismatch: {0} vs {1}")]
    ConnIndexMismatch(u32, u32),
}

/// One bit per channel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelMask(u64);

impl ChannelMask {
    pub const EMPTY: ChannelMask = ChannelMask(0);

    #[inline]
    pub fn bit(channel: ChannelId) -> Option<u64> {
        if (channel.0 as usize) < MAX_CHANNELS {
            Some(1u64 << channel.0)
        } else {
            None
        }
    }

    pub fn set(&mut self, channel: ChannelId) -> Result<(), IntentError> {
        let bit = Self::bit(channel).ok_or(IntentError::ChannelOutOfRange(channel))?;
        self.0 |= bit;
        Ok(())
    }

    #[inline]
    pub fn contains(&self, channel: ChannelId) -> bool {
        Self::bit(channel).map_or(false, |bit| self.0 & bit != 0)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline]
    pub fn bits(&self) -> u64 {
        self.0
    }

    // channels in increasing order
    pub fn iter(&self) -> impl Iterator<Item = ChannelId> {
        let bits = self.0;
        (0..MAX_CHANNELS as u32)
            .filter(move |c| bits & (1u64 << c) != 0)
            .map(ChannelId)
    }
}

/// Pending connect obligations of this rank, per peer and direction.
pub struct ConnectIntents {
    conn_index: Option<u32>,
    // peer rank -> channels to connect
    send: Vec<ChannelMask>,
    recv: Vec<ChannelMask>,
}

impl ConnectIntents {
    pub fn new(num_ranks: usize) -> Self {
        ConnectIntents {
            conn_index: None,
            send: vec![ChannelMask::EMPTY; num_ranks],
            recv: vec![ChannelMask::EMPTY; num_ranks],
        }
    }

    #[inline]
    pub fn conn_index(&self) -> Option<u32> {
        self.conn_index
    }

    // All intents pending at a time must target the same connection slot
    pub fn check_conn_index(&self, conn_index: u32) -> Result<(), IntentError> {
        match self.conn_index {
            Some(pending) if pending != conn_index && !self.is_empty() => {
                Err(IntentError::ConnIndexMismatch(pending, conn_index))
            }
            _ => Ok(()),
        }
    }

    pub fn record(
        &mut self,
        conn_type: ConnType,
        peer: usize,
        channel: ChannelId,
        conn_index: u32,
    ) -> Result<(), IntentError> {
        self.check_conn_index(conn_index)?;
        let mask = match conn_type {
            ConnType::Send => &mut self.send[peer],
            ConnType::Recv => &mut self.recv[peer],
        };
        mask.set(channel)?;
        self.conn_index = Some(conn_index);
        Ok(())
    }

    #[inline]
    pub fn send_mask(&self, peer: usize) -> ChannelMask {
        self.send[peer]
    }

    #[inline]
    pub fn recv_mask(&self, peer: usize) -> ChannelMask {
        self.recv[peer]
    }

    pub fn clear_send(&mut self, peer: usize) {
        self.send[peer] = ChannelMask::EMPTY;
        self.reset_conn_index_if_empty();
    }

    pub fn clear_recv(&mut self, peer: usize) {
        self.recv[peer] = ChannelMask::EMPTY;
        self.reset_conn_index_if_empty();
    }

    pub fn is_empty(&self) -> bool {
        self.send.iter().chain(self.recv.iter()).all(|m| m.is_empty())
    }

    fn reset_conn_index_if_empty(&mut self) {
        if self.is_empty() {
            self.conn_index = None;
        }
    }
}
