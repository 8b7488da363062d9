use std::sync::Arc;

use serde::{Deserialize, Serialize};

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
use crate::transport::NUM_PROTOCOLS;

use super::config::P2pTransportConfig;
use super::P2pTransportError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConnectHandle {
    pub token: u64,
    pub rank: usize,
    pub cuda_device_idx: i32,
}

// Data buffers live with the receiver, the sender writes into them directly
pub struct P2pSendResources {
    pub buf: Arc<TransportBuffer<SendBufMeta>>,
    pub token: u64,
    pub peer_buf: Option<Arc<TransportBuffer<RecvBufMeta>>>,
}

pub struct P2pRecvResources {
    pub buf: Arc<TransportBuffer<RecvBufMeta>>,
    pub token: u64,
    pub buf_sizes: [usize; NUM_PROTOCOLS],
    pub peer_buf: Option<Arc<TransportBuffer<SendBufMeta>>>,
}

pub struct P2pTransporter;

pub const P2P_TRANSPORTER: P2pTransporter = P2pTransporter;

impl Transporter for P2pTransporter {
    fn name(&self) -> &'static str {
        "P2P"
    }

    fn can_connect(
        &self,
        topo: &TopoSystem,
        graph: Option<&TopoGraph>,
        my_info: &PeerInfo,
        peer_info: &PeerInfo,
        catalog: &TransportCatalog,
    ) -> bool {
        let config = catalog.config_or_default::<P2pTransportConfig>("P2pTransport");
        if !config.enable || my_info.rank == peer_info.rank || my_info.host != peer_info.host {
            return false;
        }
        let max_level = match graph.and_then(|g| g.p2p_level) {
            Some(level) => level.min(config.max_level),
            None => config.max_level,
        };
        topo.link(my_info, peer_info) <= max_level
    }

    fn send_setup(
        &self,
        ctx: &TransportContext,
        _conn_id: &PeerConnId,
        my_info: &PeerInfo,
        _peer_info: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError> {
        let buf = Arc::new(TransportBuffer::new(SendBufMeta::new(), 0));
        let token = export_buffer(SharedBuffer::Send(Arc::clone(&buf)));
        let handle = P2pConnectHandle {
            token,
            rank: ctx.rank,
            cuda_device_idx: my_info.cuda_device_idx,
        };
        let resources = P2pSendResources {
            buf,
            token,
            peer_buf: None,
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
        my_info: &PeerInfo,
        _peer_info: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError> {
        let data_size = ctx.profile.buff_sizes.iter().sum::<usize>();
        let buf = Arc::new(TransportBuffer::new(RecvBufMeta::new(), data_size));
        let token = export_buffer(SharedBuffer::Recv(Arc::clone(&buf)));
        let handle = P2pConnectHandle {
            token,
            rank: ctx.rank,
            cuda_device_idx: my_info.cuda_device_idx,
        };
        let resources = P2pRecvResources {
            buf,
            token,
            buf_sizes: ctx.profile.buff_sizes,
            peer_buf: None,
        };
        Ok(TransportSetup {
            handle: ConnectHandle::serialize_from(handle)?,
            resources: Box::new(resources),
        })
    }

    fn send_connect(
        &self,
        ctx: &TransportContext,
        _conn_id: &PeerConnId,
        handles: &mut [ConnectHandle],
        origin: usize,
        resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        let receiver = handles[origin].deserialize_to::<P2pConnectHandle>()?;
        let peer_buf = import_recv_buffer(receiver.token)
            .ok_or(P2pTransportError::BufferNotFound(receiver.token, receiver.rank))?;
        let sender = resources
            .downcast_mut::<P2pSendResources>()
            .ok_or(P2pTransportError::ResourcesMismatch("send"))?;
        let conn_info = ConnDescriptor {
            bufs: protocol_buffers(peer_buf.buf_addr(), &ctx.profile.buff_sizes),
            head: sender.buf.head_addr(),
            tail: peer_buf.tail_addr(),
            slots_sizes: 0,
            step: 0,
            flags: ConnFlags::DIRECT,
            transport: 0,
        };
        sender.peer_buf = Some(peer_buf);
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
        let sender = handles[origin].deserialize_to::<P2pConnectHandle>()?;
        let peer_buf = import_send_buffer(sender.token)
            .ok_or(P2pTransportError::BufferNotFound(sender.token, sender.rank))?;
        let receiver = resources
            .downcast_mut::<P2pRecvResources>()
            .ok_or(P2pTransportError::ResourcesMismatch("recv"))?;
        let conn_info = ConnDescriptor {
            bufs: protocol_buffers(receiver.buf.buf_addr(), &receiver.buf_sizes),
            head: peer_buf.head_addr(),
            tail: receiver.buf.tail_addr(),
            slots_sizes: 0,
            step: 0,
            flags: ConnFlags::DIRECT,
            transport: 0,
        };
        receiver.peer_buf = Some(peer_buf);
        Ok(TransportConnect::Connected(conn_info))
    }

    fn free(&self, _conn_id: &PeerConnId, resources: AnyResources) -> Result<(), TransporterError> {
        if let Some(sender) = resources.downcast_ref::<P2pSendResources>() {
            revoke_buffer(sender.token);
        } else if let Some(receiver) = resources.downcast_ref::<P2pRecvResources>() {
            revoke_buffer(receiver.token);
        } else {
            Err(P2pTransportError::ResourcesMismatch("free"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::comm::topo::{GraphPattern, LinkType};
    use crate::comm::HostIdent;

    fn peer(rank: usize, host: &str) -> PeerInfo {
        PeerInfo::new(rank, HostIdent::new(host), IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn p2p_level_bounds_capability() {
        let catalog = TransportCatalog::new();
        let mut topo = TopoSystem::new();
        let (a, b, c) = (peer(0, "h0"), peer(1, "h0"), peer(2, "h0"));
        topo.set_link(0, 1, LinkType::NvLink);
        topo.set_link(0, 2, LinkType::Sys);
        assert!(P2P_TRANSPORTER.can_connect(&topo, None, &a, &b, &catalog));
        assert!(!P2P_TRANSPORTER.can_connect(&topo, None, &a, &c, &catalog));
        assert!(!P2P_TRANSPORTER.can_connect(&topo, None, &a, &peer(3, "h1"), &catalog));

        let mut graph = TopoGraph::new(0, GraphPattern::Ring);
        graph.p2p_level = Some(LinkType::Loc);
        assert!(!P2P_TRANSPORTER.can_connect(&topo, Some(&graph), &a, &b, &catalog));

        catalog.register_config(
            "P2pTransport".to_string(),
            P2pTransportConfig {
                enable: false,
                max_level: LinkType::Sys,
            },
        );
        assert!(!P2P_TRANSPORTER.can_connect(&topo, None, &a, &b, &catalog));
    }
}
