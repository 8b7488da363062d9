use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use memoffset::offset_of;

use super::meta::{RecvBufMeta, SendBufMeta};
use super::NUM_PROTOCOLS;

// Transport buffer is a host buffer headed by its metadata,
// kernels read/write the data region that follows the metadata
pub struct TransportBuffer<T> {
    ptr: *mut T,
    size: usize,
    align: usize,
}

// metadata fields are atomics, the data region is only handed out as raw addresses
unsafe impl<T: Send> Send for TransportBuffer<T> {}
unsafe impl<T: Sync> Sync for TransportBuffer<T> {}

impl<T> TransportBuffer<T> {
    // `data_size` bytes follow the metadata
    pub fn new(meta: T, data_size: usize) -> TransportBuffer<T> {
        let size = std::mem::size_of::<T>() + data_size;
        let align = std::mem::align_of::<T>();
        let layout = match Layout::from_size_align(size, align) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid transport buffer layout: size={}, align={}", size, align),
        };
        let ptr = unsafe { alloc_zeroed(layout) } as *mut T;
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        unsafe { ptr.write(meta) };
        TransportBuffer { ptr, size, align }
    }

    #[inline]
    pub fn meta(&self) -> &T {
        unsafe { &*self.ptr }
    }

    #[inline]
    pub fn meta_addr(&self) -> u64 {
        self.ptr as u64
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn buf_addr(&self) -> u64 {
        unsafe { self.ptr.add(1) as u64 }
    }

    #[inline]
    pub fn buf_size(&self) -> usize {
        self.size - std::mem::size_of::<T>()
    }
}

impl<T> Drop for TransportBuffer<T> {
    fn drop(&mut self) {
        unsafe {
            std::ptr::drop_in_place(self.ptr);
            let layout = Layout::from_size_align_unchecked(self.size, self.align);
            dealloc(self.ptr as *mut u8, layout);
        }
    }
}

impl TransportBuffer<SendBufMeta> {
    #[inline]
    pub fn head_addr(&self) -> u64 {
        self.meta_addr() + offset_of!(SendBufMeta, head) as u64
    }
}

impl TransportBuffer<RecvBufMeta> {
    #[inline]
    pub fn tail_addr(&self) -> u64 {
        self.meta_addr() + offset_of!(RecvBufMeta, tail) as u64
    }

    #[inline]
    pub fn slots_sizes_addr(&self) -> u64 {
        self.meta_addr() + offset_of!(RecvBufMeta, slots_sizes) as u64
    }
}

// Per-protocol buffers laid out back to back from `base`
pub fn protocol_buffers(base: u64, buf_sizes: &[usize; NUM_PROTOCOLS]) -> [u64; NUM_PROTOCOLS] {
    let mut bufs = [0u64; NUM_PROTOCOLS];
    let mut curr = base;
    for (proto, buf) in bufs.iter_mut().enumerate() {
        *buf = curr;
        curr += buf_sizes[proto] as u64;
    }
    bufs
}

#[derive(Clone)]
pub enum SharedBuffer {
    Send(Arc<TransportBuffer<SendBufMeta>>),
    Recv(Arc<TransportBuffer<RecvBufMeta>>),
}

// Buffers exported to other ranks served by this process, keyed by a random token
// carried in connect handles
static SHARED_BUFFERS: Lazy<DashMap<u64, SharedBuffer>> = Lazy::new(DashMap::new);

pub fn export_buffer(buffer: SharedBuffer) -> u64 {
    loop {
        let token: u64 = rand::random();
        if token == 0 {
            continue;
        }
        if let dashmap::mapref::entry::Entry::Vacant(entry) = SHARED_BUFFERS.entry(token) {
            entry.insert(buffer);
            return token;
        }
    }
}

pub fn import_send_buffer(token: u64) -> Option<Arc<TransportBuffer<SendBufMeta>>> {
    match SHARED_BUFFERS.get(&token)?.value() {
        SharedBuffer::Send(buf) => Some(Arc::clone(buf)),
        SharedBuffer::Recv(_) => None,
    }
}

pub fn import_recv_buffer(token: u64) -> Option<Arc<TransportBuffer<RecvBufMeta>>> {
    match SHARED_BUFFERS.get(&token)?.value() {
        SharedBuffer::Recv(buf) => Some(Arc::clone(buf)),
        SharedBuffer::Send(_) => None,
    }
}

pub fn revoke_buffer(token: u64) {
    SHARED_BUFFERS.remove(&token);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;

    #[test]
    fn data_region_follows_metadata() {
        let buf = TransportBuffer::new(RecvBufMeta::new(), 1024);
        assert_eq!(buf.buf_addr() - buf.meta_addr(), 4096);
        assert_eq!(buf.buf_size(), 1024);
        assert_eq!(buf.meta_addr() % 4096, 0);
        buf.meta().tail.store(5, Ordering::Relaxed);
        assert_eq!(buf.tail_addr(), buf.meta_addr());
        assert_eq!(buf.slots_sizes_addr() - buf.meta_addr(), 128);
        assert_eq!(buf.meta().tail.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn exported_buffer_is_importable_until_revoked() {
        let buf = Arc::new(TransportBuffer::new(SendBufMeta::new(), 0));
        let token = export_buffer(SharedBuffer::Send(Arc::clone(&buf)));
        assert!(import_recv_buffer(token).is_none());
        let imported = import_send_buffer(token).unwrap();
        assert!(Arc::ptr_eq(&imported, &buf));
        revoke_buffer(token);
        assert!(import_send_buffer(token).is_none());
    }
}
