use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::transport::buffer::TransportBuffer;
use crate::transport::meta::{RecvBufMeta, SendBufMeta};
use crate::transport::NUM_PROTOCOLS;

pub const HANDSHAKE_SIZE: usize = std::mem::size_of::<u64>();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConnectHandle {
    pub addr: SocketAddr,
    pub magic: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetSendHandle {
    pub rank: usize,
}

// Host staging buffers of a proxied connection
pub struct NetSendResources {
    pub buf: Arc<TransportBuffer<SendBufMeta>>,
    pub buf_sizes: [usize; NUM_PROTOCOLS],
    pub stream: Option<TcpStream>,
    // handshake bytes already written
    pub written: usize,
}

pub struct NetRecvResources {
    pub buf: Arc<TransportBuffer<RecvBufMeta>>,
    pub buf_sizes: [usize; NUM_PROTOCOLS],
    pub listener: TcpListener,
    pub magic: u64,
    pub stream: Option<TcpStream>,
    pub handshake: [u8; HANDSHAKE_SIZE],
    // handshake bytes already read
    pub received: usize,
}
