use std::sync::Arc;

use super::config::CollNetConfig;
use super::resources::{
    CollNetConnectHandle, CollNetRecvResources, CollNetReply, CollNetSendResources,
    COLL_NET_MAGIC,
};
use super::CollNetTransportError;
use crate::comm::topo::{TopoGraph, TopoSystem};
use crate::comm::PeerInfo;
use crate::transport::buffer::{
    export_buffer, import_recv_buffer, protocol_buffers, revoke_buffer, SharedBuffer,
    TransportBuffer,
};
use crate::transport::catalog::TransportCatalog;
use crate::transport::channel::PeerConnId;
use crate::transport::connector::{ConnDescriptor, ConnFlags};
use crate::transport::meta::{RecvBufMeta, SendBufMeta};
use crate::transport::transporter::{
    AnyResources, ConnectHandle, TransportConnect, TransportContext, TransportSetup, Transporter,
    TransporterError,
};

pub struct CollNetTransporter;

pub const COLL_NET_TRANSPORTER: CollNetTransporter = CollNetTransporter;

fn check_enabled(ctx: &TransportContext) -> Result<(), CollNetTransportError> {
    let config = ctx
        .catalog
        .config_or_default::<CollNetConfig>("CollNetTransport");
    if config.enable {
        Ok(())
    } else {
        Err(CollNetTransportError::Disabled)
    }
}

impl Transporter for CollNetTransporter {
    fn name(&self) -> &'static str {
        "COLLNET"
    }

    // Only reachable through the collective network setup, never for a peer pair
    #[inline]
    fn can_connect(
        &self,
        _topo: &TopoSystem,
        _graph: Option<&TopoGraph>,
        _my_info: &PeerInfo,
        _peer_info: &PeerInfo,
        _catalog: &TransportCatalog,
    ) -> bool {
        false
    }

    fn send_setup(
        &self,
        ctx: &TransportContext,
        _conn_id: &PeerConnId,
        _my_info: &PeerInfo,
        _peer_info: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError> {
        check_enabled(ctx)?;
        let resources = CollNetSendResources {
            buf: Arc::new(TransportBuffer::new(SendBufMeta::new(), 0)),
            buf_sizes: ctx.profile.buff_sizes,
            recv_buf: None,
        };
        let handle = CollNetConnectHandle {
            magic: COLL_NET_MAGIC,
            rank: ctx.rank,
        };
        Ok(TransportSetup {
            handle: ConnectHandle::serialize_from(handle)?,
            resources: Box::new(resources),
        })
    }

    fn recv_setup(
        &self,
        ctx: &TransportContext,
        _conn_id: &PeerConnId,
        _my_info: &PeerInfo,
        _peer_info: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError> {
        check_enabled(ctx)?;
        let data_size = ctx.profile.buff_sizes.iter().sum::<usize>();
        let resources = CollNetRecvResources {
            buf: Arc::new(TransportBuffer::new(RecvBufMeta::new(), data_size)),
            buf_sizes: ctx.profile.buff_sizes,
            token: None,
        };
        let handle = CollNetConnectHandle {
            magic: COLL_NET_MAGIC,
            rank: ctx.rank,
        };
        Ok(TransportSetup {
            handle: ConnectHandle::serialize_from(handle)?,
            resources: Box::new(resources),
        })
    }

    // `handles[origin]` carries the reply of the recv master of this node
    fn send_connect(
        &self,
        _ctx: &TransportContext,
        _conn_id: &PeerConnId,
        handles: &mut [ConnectHandle],
        origin: usize,
        resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        let reply = handles
            .get(origin)
            .ok_or(CollNetTransportError::InvalidHandle(origin))?
            .deserialize_to::<CollNetReply>()?;
        if reply.magic != COLL_NET_MAGIC {
            Err(CollNetTransportError::InvalidHandle(origin))?;
        }
        let recv_buf = import_recv_buffer(reply.token)
            .ok_or(CollNetTransportError::BufferNotFound(reply.token))?;
        let sender = resources
            .downcast_mut::<CollNetSendResources>()
            .ok_or(CollNetTransportError::ResourcesMismatch("send"))?;
        let conn_info = ConnDescriptor {
            bufs: protocol_buffers(recv_buf.buf_addr(), &sender.buf_sizes),
            head: sender.buf.head_addr(),
            tail: recv_buf.tail_addr(),
            slots_sizes: 0,
            step: 0,
            flags: ConnFlags::COLL_NET | ConnFlags::SHARED,
            transport: 0,
        };
        sender.recv_buf = Some(recv_buf);
        Ok(TransportConnect::Connected(conn_info))
    }

    // Aggregates the handles of every node master,
    // then replaces `handles[origin]` with the reply for the send master
    fn recv_connect(
        &self,
        _ctx: &TransportContext,
        _conn_id: &PeerConnId,
        handles: &mut [ConnectHandle],
        origin: usize,
        resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        if origin >= handles.len() {
            Err(CollNetTransportError::InvalidHandle(origin))?;
        }
        for (idx, handle) in handles.iter().enumerate() {
            let master = handle.deserialize_to::<CollNetConnectHandle>()?;
            if master.magic != COLL_NET_MAGIC {
                Err(CollNetTransportError::InvalidHandle(idx))?;
            }
        }
        let receiver = resources
            .downcast_mut::<CollNetRecvResources>()
            .ok_or(CollNetTransportError::ResourcesMismatch("recv"))?;
        let token = match receiver.token {
            Some(token) => token,
            None => {
                let token = export_buffer(SharedBuffer::Recv(Arc::clone(&receiver.buf)));
                receiver.token = Some(token);
                token
            }
        };
        let reply = CollNetReply {
            magic: COLL_NET_MAGIC,
            token,
        };
        handles[origin] = ConnectHandle::serialize_from(reply)?;
        let conn_info = ConnDescriptor {
            bufs: protocol_buffers(receiver.buf.buf_addr(), &receiver.buf_sizes),
            head: 0,
            tail: receiver.buf.tail_addr(),
            slots_sizes: receiver.buf.slots_sizes_addr(),
            step: 0,
            flags: ConnFlags::COLL_NET,
            transport: 0,
        };
        Ok(TransportConnect::Connected(conn_info))
    }

    fn free(&self, _conn_id: &PeerConnId, resources: AnyResources) -> Result<(), TransporterError> {
        if let Some(receiver) = resources.downcast_ref::<CollNetRecvResources>() {
            if let Some(token) = receiver.token {
                revoke_buffer(token);
            }
        } else if resources.downcast_ref::<CollNetSendResources>().is_none() {
            Err(CollNetTransportError::ResourcesMismatch("free"))?;
        }
        Ok(())
    }
}
