use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use super::config::NetTransportConfig;
use super::resources::{
    NetConnectHandle, NetRecvResources, NetSendHandle, NetSendResources, HANDSHAKE_SIZE,
};
use super::NetTransportError;
use crate::comm::topo::{TopoGraph, TopoSystem};
use crate::comm::{CommProfile, PeerInfo};
use crate::transport::buffer::{protocol_buffers, TransportBuffer};
use crate::transport::catalog::TransportCatalog;
use crate::transport::channel::PeerConnId;
use crate::transport::connector::{ConnDescriptor, ConnFlags};
use crate::transport::meta::{RecvBufMeta, SendBufMeta};
use crate::transport::transporter::{
    AnyResources, ConnectHandle, TransportConnect, TransportContext, TransportSetup, Transporter,
    TransporterError,
};
use crate::utils::tcp::bind_socket;

pub struct NetTransporter;

pub const NET_TRANSPORTER: NetTransporter = NetTransporter;

fn net_send_setup(
    my_info: &PeerInfo,
    profile: &CommProfile,
) -> Result<TransportSetup, NetTransportError> {
    let data_size = profile.buff_sizes.iter().sum::<usize>();
    let resources = NetSendResources {
        buf: Arc::new(TransportBuffer::new(SendBufMeta::new(), data_size)),
        buf_sizes: profile.buff_sizes,
        stream: None,
        written: 0,
    };
    let handle = NetSendHandle { rank: my_info.rank };
    let setup = TransportSetup {
        handle: ConnectHandle::serialize_from(handle)?,
        resources: Box::new(resources),
    };
    Ok(setup)
}

fn net_recv_setup(
    my_info: &PeerInfo,
    profile: &CommProfile,
    config: &NetTransportConfig,
) -> Result<TransportSetup, NetTransportError> {
    let listen_ip = config.listen_addr.unwrap_or(my_info.addr);
    let socket = bind_socket(&SocketAddr::new(listen_ip, 0))?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    let listener: TcpListener = socket.into();
    let mut addr = listener.local_addr()?;
    if addr.ip().is_unspecified() {
        addr.set_ip(my_info.addr);
    }
    let magic = rand::random::<u64>();

    let data_size = profile.buff_sizes.iter().sum::<usize>();
    let resources = NetRecvResources {
        buf: Arc::new(TransportBuffer::new(RecvBufMeta::new(), data_size)),
        buf_sizes: profile.buff_sizes,
        listener,
        magic,
        stream: None,
        handshake: [0u8; HANDSHAKE_SIZE],
        received: 0,
    };
    log::trace!("Rank {} NET receiver listening on {}", my_info.rank, addr);
    let handle = NetConnectHandle { addr, magic };
    let setup = TransportSetup {
        handle: ConnectHandle::serialize_from(handle)?,
        resources: Box::new(resources),
    };
    Ok(setup)
}

// Connect to the receiver's listener and echo its magic back
fn net_send_connect(
    handle: &NetConnectHandle,
    resources: &mut NetSendResources,
    config: &NetTransportConfig,
) -> Result<TransportConnect, NetTransportError> {
    if resources.stream.is_none() {
        match TcpStream::connect_timeout(&handle.addr, config.connect_timeout()) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_nonblocking(true)?;
                resources.stream = Some(stream);
            }
            Err(err) if err.kind() == ErrorKind::TimedOut => {
                return Ok(TransportConnect::InProgress);
            }
            Err(err) => return Err(err.into()),
        }
    }
    if let Some(stream) = resources.stream.as_mut() {
        let mut magic = [0u8; HANDSHAKE_SIZE];
        LittleEndian::write_u64(&mut magic, handle.magic);
        while resources.written < HANDSHAKE_SIZE {
            match stream.write(&magic[resources.written..]) {
                Ok(0) => return Err(NetTransportError::HandshakeClosed),
                Ok(n) => resources.written += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(TransportConnect::InProgress);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    let conn_info = ConnDescriptor {
        bufs: protocol_buffers(resources.buf.buf_addr(), &resources.buf_sizes),
        head: resources.buf.head_addr(),
        tail: 0,
        slots_sizes: 0,
        step: 0,
        flags: ConnFlags::NET,
        transport: 0,
    };
    Ok(TransportConnect::Connected(conn_info))
}

// Accept the sender and check the magic it echoes,
// in progress until both happened
fn net_recv_connect(
    resources: &mut NetRecvResources,
) -> Result<TransportConnect, NetTransportError> {
    if resources.stream.is_none() {
        match resources.listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                resources.stream = Some(stream);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return Ok(TransportConnect::InProgress);
            }
            Err(err) => return Err(err.into()),
        }
    }
    if let Some(stream) = resources.stream.as_mut() {
        while resources.received < HANDSHAKE_SIZE {
            match stream.read(&mut resources.handshake[resources.received..]) {
                Ok(0) => return Err(NetTransportError::HandshakeClosed),
                Ok(n) => resources.received += n,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(TransportConnect::InProgress);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    let magic = LittleEndian::read_u64(&resources.handshake);
    if magic != resources.magic {
        return Err(NetTransportError::MagicMismatch(magic, resources.magic));
    }
    let conn_info = ConnDescriptor {
        bufs: protocol_buffers(resources.buf.buf_addr(), &resources.buf_sizes),
        head: 0,
        tail: resources.buf.tail_addr(),
        slots_sizes: resources.buf.slots_sizes_addr(),
        step: 0,
        flags: ConnFlags::NET,
        transport: 0,
    };
    Ok(TransportConnect::Connected(conn_info))
}

impl Transporter for NetTransporter {
    fn name(&self) -> &'static str {
        "NET"
    }

    #[inline]
    fn can_connect(
        &self,
        _topo: &TopoSystem,
        _graph: Option<&TopoGraph>,
        my_info: &PeerInfo,
        peer_info: &PeerInfo,
        _catalog: &TransportCatalog,
    ) -> bool {
        my_info.rank != peer_info.rank
    }

    fn send_setup(
        &self,
        ctx: &TransportContext,
        _conn_id: &PeerConnId,
        my_info: &PeerInfo,
        _peer_info: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError> {
        let setup = net_send_setup(my_info, ctx.profile)?;
        Ok(setup)
    }

    fn recv_setup(
        &self,
        ctx: &TransportContext,
        _conn_id: &PeerConnId,
        my_info: &PeerInfo,
        _peer_info: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError> {
        let config = ctx
            .catalog
            .config_or_default::<NetTransportConfig>("NetTransport");
        let setup = net_recv_setup(my_info, ctx.profile, &config)?;
        Ok(setup)
    }

    fn send_connect(
        &self,
        ctx: &TransportContext,
        _conn_id: &PeerConnId,
        handles: &mut [ConnectHandle],
        origin: usize,
        resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        let config = ctx
            .catalog
            .config_or_default::<NetTransportConfig>("NetTransport");
        let handle = handles
            .get(origin)
            .ok_or(NetTransportError::InvalidHandle(origin))?
            .deserialize_to::<NetConnectHandle>()?;
        let resources = resources
            .downcast_mut::<NetSendResources>()
            .ok_or(NetTransportError::DowncastResources("send"))?;
        let connect = net_send_connect(&handle, resources, &config)?;
        Ok(connect)
    }

    fn recv_connect(
        &self,
        _ctx: &TransportContext,
        _conn_id: &PeerConnId,
        _handles: &mut [ConnectHandle],
        _origin: usize,
        resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        let resources = resources
            .downcast_mut::<NetRecvResources>()
            .ok_or(NetTransportError::DowncastResources("recv"))?;
        let connect = net_recv_connect(resources)?;
        Ok(connect)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::comm::{CommunicatorId, HostIdent};

    #[test]
    fn receiver_waits_for_the_sender_handshake() {
        let profile = CommProfile {
            buff_sizes: [4096],
        };
        let config = NetTransportConfig::default();
        let receiver = PeerInfo::new(0, HostIdent::new("h0"), IpAddr::V4(Ipv4Addr::LOCALHOST));
        let sender = PeerInfo::new(1, HostIdent::new("h1"), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let recv_setup = net_recv_setup(&receiver, &profile, &config).unwrap();
        let mut recv_resources = recv_setup.resources;
        let recv_resources = recv_resources.downcast_mut::<NetRecvResources>().unwrap();
        assert!(matches!(
            net_recv_connect(recv_resources).unwrap(),
            TransportConnect::InProgress
        ));

        let send_setup = net_send_setup(&sender, &profile).unwrap();
        let mut send_resources = send_setup.resources;
        let send_resources = send_resources.downcast_mut::<NetSendResources>().unwrap();
        let handle: NetConnectHandle = recv_setup.handle.deserialize_to().unwrap();
        let connected = net_send_connect(&handle, send_resources, &config).unwrap();
        assert!(matches!(connected, TransportConnect::Connected(d) if d.flags == ConnFlags::NET));

        let connected = loop {
            match net_recv_connect(recv_resources).unwrap() {
                TransportConnect::Connected(desc) => break desc,
                TransportConnect::InProgress => std::thread::yield_now(),
            }
        };
        assert_eq!(connected.tail, recv_resources.buf.tail_addr());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let profile = CommProfile::default();
        let config = NetTransportConfig::default();
        let receiver = PeerInfo::new(0, HostIdent::new("h0"), IpAddr::V4(Ipv4Addr::LOCALHOST));
        let sender = PeerInfo::new(1, HostIdent::new("h1"), IpAddr::V4(Ipv4Addr::LOCALHOST));

        let recv_setup = net_recv_setup(&receiver, &profile, &config).unwrap();
        let mut recv_resources = recv_setup.resources;
        let recv_resources = recv_resources.downcast_mut::<NetRecvResources>().unwrap();
        let mut handle: NetConnectHandle = recv_setup.handle.deserialize_to().unwrap();
        handle.magic ^= 1;

        let send_setup = net_send_setup(&sender, &profile).unwrap();
        let mut send_resources = send_setup.resources;
        let send_resources = send_resources.downcast_mut::<NetSendResources>().unwrap();
        net_send_connect(&handle, send_resources, &config).unwrap();

        let err = loop {
            match net_recv_connect(recv_resources) {
                Ok(TransportConnect::InProgress) => std::thread::yield_now(),
                Ok(TransportConnect::Connected(_)) => panic!("connected with a wrong magic"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, NetTransportError::MagicMismatch(_, _)));
    }

    #[test]
    fn out_of_range_origin_is_an_error() {
        let profile = CommProfile::default();
        let catalog = TransportCatalog::new();
        let topo = TopoSystem::new();
        let ctx = TransportContext {
            comm_id: CommunicatorId(0),
            rank: 1,
            num_ranks: 2,
            profile: &profile,
            catalog: &catalog,
            topo: &topo,
            graph: None,
        };
        let sender = PeerInfo::new(1, HostIdent::new("h1"), IpAddr::V4(Ipv4Addr::LOCALHOST));
        let conn_id = PeerConnId {
            peer_rank: 0,
            channel: crate::transport::channel::ChannelId(0),
            conn_index: 0,
            conn_type: crate::transport::channel::ConnType::Send,
        };
        let mut resources = net_send_setup(&sender, &profile).unwrap().resources;
        let mut handles = [ConnectHandle::zeroed()];
        let err = NET_TRANSPORTER
            .send_connect(&ctx, &conn_id, &mut handles, 1, &mut resources)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NetTransportError>(),
            Some(NetTransportError::InvalidHandle(1))
        ));
    }
}
