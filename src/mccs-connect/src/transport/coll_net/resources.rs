use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::transport::buffer::TransportBuffer;
use crate::transport::meta::{RecvBufMeta, SendBufMeta};
use crate::transport::NUM_PROTOCOLS;

pub const COLL_NET_MAGIC: u64 = 0x636f_6c6c_6e65_7431;

// Advertised by a node master before the aggregated connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollNetConnectHandle {
    pub magic: u64,
    pub rank: usize,
}

// Written back by the recv master, handed to the send master of its node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollNetReply {
    pub magic: u64,
    pub token: u64,
}

pub struct CollNetSendResources {
    pub buf: Arc<TransportBuffer<SendBufMeta>>,
    pub buf_sizes: [usize; NUM_PROTOCOLS],
    // imported on connect
    pub recv_buf: Option<Arc<TransportBuffer<RecvBufMeta>>>,
}

pub struct CollNetRecvResources {
    pub buf: Arc<TransportBuffer<RecvBufMeta>>,
    pub buf_sizes: [usize; NUM_PROTOCOLS],
    // exported on connect
    pub token: Option<u64>,
}
