use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::config::ShmLocality;
use crate::transport::buffer::TransportBuffer;
use crate::transport::meta::{RecvBufMeta, SendBufMeta};
use crate::transport::NUM_PROTOCOLS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShmConnectHandle {
    // token of the exported buffer
    pub token: u64,
    pub rank: usize,
}

pub struct ShmSendResources {
    pub buf: Arc<TransportBuffer<SendBufMeta>>,
    pub token: u64,
    pub buf_sizes: [usize; NUM_PROTOCOLS],
    pub locality: ShmLocality,
    // imported on connect
    pub receiver_buf: Option<Arc<TransportBuffer<RecvBufMeta>>>,
}

pub struct ShmRecvResources {
    pub buf: Arc<TransportBuffer<RecvBufMeta>>,
    pub token: u64,
    pub buf_sizes: [usize; NUM_PROTOCOLS],
    pub locality: ShmLocality,
    // imported on connect
    pub sender_buf: Option<Arc<TransportBuffer<SendBufMeta>>>,
}
