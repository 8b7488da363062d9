use std::sync::Arc;

use crate::comm::topo::{TopoGraph, TopoSystem};
use crate::comm::PeerInfo;
use crate::transport::buffer::{
    export_buffer, import_recv_buffer, import_send_buffer, protocol_buffers, revoke_buffer,
    SharedBuffer, TransportBuffer,
};
use crate::transport::catalog::TransportCatalog;
use crate::transport::channel::PeerConnId;
use crate::transport::connector::{ConnDescriptor, ConnFlags};
use crate::transport::meta::{RecvBufMeta, SendBufMeta};
use crate::transport::transporter::{
    AnyResources, ConnectHandle, TransportConnect, TransportContext, TransportSetup, Transporter,
    TransporterError,
};

use super::config::{ShmLocality, ShmTransportConfig};
use super::resources::{ShmConnectHandle, ShmRecvResources, ShmSendResources};
use super::ShmTransportError;

pub struct ShmTransporter;

pub const SHM_TRANSPORTER: ShmTransporter = ShmTransporter;

impl Transporter for ShmTransporter {
    fn name(&self) -> &'static str {
        "SHM"
    }

    #[inline]
    fn can_connect(
        &self,
        _topo: &TopoSystem,
        _graph: Option<&TopoGraph>,
        my_info: &PeerInfo,
        peer_info: &PeerInfo,
        catalog: &TransportCatalog,
    ) -> bool {
        let config = catalog.config_or_default::<ShmTransportConfig>("ShmTransport");
        config.enable && my_info.rank != peer_info.rank && my_info.host == peer_info.host
    }

    fn send_setup(
        &self,
        ctx: &TransportContext,
        _conn_id: &PeerConnId,
        _my_info: &PeerInfo,
        _peer_info: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError> {
        let config = ctx
            .catalog
            .config_or_default::<ShmTransportConfig>("ShmTransport");
        let data_size = if config.locality == ShmLocality::Sender {
            ctx.profile.buff_sizes.iter().sum::<usize>()
        } else {
            0
        };
        let buf = Arc::new(TransportBuffer::new(SendBufMeta::new(), data_size));
        let token = export_buffer(SharedBuffer::Send(Arc::clone(&buf)));
        let handle = ShmConnectHandle {
            token,
            rank: ctx.rank,
        };
        let resources = ShmSendResources {
            buf,
            token,
            buf_sizes: ctx.profile.buff_sizes,
            locality: config.locality,
            receiver_buf: None,
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
        let config = ctx
            .catalog
            .config_or_default::<ShmTransportConfig>("ShmTransport");
        let data_size = if config.locality == ShmLocality::Receiver {
            ctx.profile.buff_sizes.iter().sum::<usize>()
        } else {
            0
        };
        let buf = Arc::new(TransportBuffer::new(RecvBufMeta::new(), data_size));
        let token = export_buffer(SharedBuffer::Recv(Arc::clone(&buf)));
        let handle = ShmConnectHandle {
            token,
            rank: ctx.rank,
        };
        let resources = ShmRecvResources {
            buf,
            token,
            buf_sizes: ctx.profile.buff_sizes,
            locality: config.locality,
            sender_buf: None,
        };
        Ok(TransportSetup {
            handle: ConnectHandle::serialize_from(handle)?,
            resources: Box::new(resources),
        })
    }

    fn send_connect(
        &self,
        _ctx: &TransportContext,
        _conn_id: &PeerConnId,
        handles: &mut [ConnectHandle],
        origin: usize,
        resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        let receiver = handles[origin].deserialize_to::<ShmConnectHandle>()?;
        let recv_buf = import_recv_buffer(receiver.token)
            .ok_or(ShmTransportError::BufferNotFound(receiver.token, receiver.rank))?;
        let sender = resources
            .downcast_mut::<ShmSendResources>()
            .ok_or(ShmTransportError::ResourcesMismatch("send"))?;

        let data_base = match sender.locality {
            ShmLocality::Sender => sender.buf.buf_addr(),
            ShmLocality::Receiver => recv_buf.buf_addr(),
        };
        let conn_info = ConnDescriptor {
            bufs: protocol_buffers(data_base, &sender.buf_sizes),
            head: sender.buf.head_addr(),
            tail: recv_buf.tail_addr(),
            slots_sizes: 0,
            step: 0,
            flags: ConnFlags::SHARED,
            transport: 0,
        };
        sender.receiver_buf = Some(recv_buf);
        Ok(TransportConnect::Connected(conn_info))
    }

    fn recv_connect(
        &self,
        _ctx: &TransportContext,
        _conn_id: &PeerConnId,
        handles: &mut [ConnectHandle],
        origin: usize,
        resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        let sender = handles[origin].deserialize_to::<ShmConnectHandle>()?;
        let send_buf = import_send_buffer(sender.token)
            .ok_or(ShmTransportError::BufferNotFound(sender.token, sender.rank))?;
        let receiver = resources
            .downcast_mut::<ShmRecvResources>()
            .ok_or(ShmTransportError::ResourcesMismatch("recv"))?;

        let data_base = match receiver.locality {
            ShmLocality::Sender => send_buf.buf_addr(),
            ShmLocality::Receiver => receiver.buf.buf_addr(),
        };
        let conn_info = ConnDescriptor {
            bufs: protocol_buffers(data_base, &receiver.buf_sizes),
            head: send_buf.head_addr(),
            tail: receiver.buf.tail_addr(),
            slots_sizes: receiver.buf.slots_sizes_addr(),
            step: 0,
            flags: ConnFlags::SHARED,
            transport: 0,
        };
        receiver.sender_buf = Some(send_buf);
        Ok(TransportConnect::Connected(conn_info))
    }

    fn free(&self, _conn_id: &PeerConnId, resources: AnyResources) -> Result<(), TransporterError> {
        if let Some(sender) = resources.downcast_ref::<ShmSendResources>() {
            revoke_buffer(sender.token);
        } else if let Some(receiver) = resources.downcast_ref::<ShmRecvResources>() {
            revoke_buffer(receiver.token);
        } else {
            Err(ShmTransportError::ResourcesMismatch("free"))?;
        }
        Ok(())
    }
}
