use std::sync::atomic::{AtomicI32, AtomicU64};

use super::NUM_BUFFER_SLOTS;

const CACHE_LINE_SIZE: usize = 128;

#[repr(C, align(4096))]
pub struct SendBufMeta {
    pub head: AtomicU64,
    _pad1: [u8; CACHE_LINE_SIZE - std::mem::size_of::<u64>()],
    pub slots_offsets: [AtomicI32; NUM_BUFFER_SLOTS],
}

static_assertions::const_assert_eq!(std::mem::size_of::<SendBufMeta>(), 4096);

impl SendBufMeta {
    pub fn new() -> Self {
        SendBufMeta {
            head: AtomicU64::new(0),
            _pad1: [0; CACHE_LINE_SIZE - std::mem::size_of::<u64>()],
            slots_offsets: std::array::from_fn(|_| AtomicI32::new(0)),
        }
    }
}

impl Default for SendBufMeta {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C, align(4096))]
pub struct RecvBufMeta {
    pub tail: AtomicU64,
    _pad1: [u8; CACHE_LINE_SIZE - std::mem::size_of::<u64>()],
    pub slots_sizes: [AtomicI32; NUM_BUFFER_SLOTS],
    pub slots_offsets: [AtomicI32; NUM_BUFFER_SLOTS],
    pub flush: AtomicI32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<RecvBufMeta>(), 4096);

impl RecvBufMeta {
    pub fn new() -> Self {
        RecvBufMeta {
            tail: AtomicU64::new(0),
            _pad1: [0; CACHE_LINE_SIZE - std::mem::size_of::<u64>()],
            slots_sizes: std::array::from_fn(|_| AtomicI32::new(0)),
            slots_offsets: std::array::from_fn(|_| AtomicI32::new(0)),
            flush: AtomicI32::new(0),
        }
    }
}

impl Default for RecvBufMeta {
    fn default() -> Self {
        Self::new()
    }
}
