use std::net::SocketAddr;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut};
use smol::io::{AsyncReadExt, AsyncWriteExt};
use smol::lock::Mutex;
use smol::net::{TcpListener, TcpStream};
use socket2::Socket;

use super::{Bootstrap, BootstrapError, BootstrapHandle};
use crate::utils::tcp;

const EXCHANGE_INFO_SEND_SIZE: usize = 80;
const SOCK_ADDR_SEND_SIZE: usize = 32;

static_assertions::const_assert!(SOCK_ADDR_SEND_SIZE >= tcp::SOCKET_ADDR_ENCODED_MAX);
static_assertions::const_assert!(
    EXCHANGE_INFO_SEND_SIZE >= 16 + 2 * tcp::SOCKET_ADDR_ENCODED_MAX
);

struct BootstrapExchangeInfo {
    rank: usize,
    num_ranks: usize,
    listen_addr_root: SocketAddr,
    listen_addr: SocketAddr,
}

impl BootstrapExchangeInfo {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(self.rank as u64);
        buf.put_u64(self.num_ranks as u64);
        tcp::encode_socket_addr(&self.listen_addr_root, buf);
        tcp::encode_socket_addr(&self.listen_addr, buf);
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, BootstrapError> {
        let rank = buf.get_u64() as usize;
        let num_ranks = buf.get_u64() as usize;
        let listen_addr_root = tcp::decode_socket_addr(buf)?;
        let listen_addr = tcp::decode_socket_addr(buf)?;
        Ok(Self {
            rank,
            num_ranks,
            listen_addr_root,
            listen_addr,
        })
    }
}

struct UnexpectedConn {
    stream: TcpStream,
    peer: usize,
    tag: u32,
}

struct BootstrapRing {
    ring_recv: TcpStream,
    ring_send: TcpStream,
}

/// TCP bootstrap of one rank: a listener for tagged point-to-point messages
/// plus a ring of persistent streams for all-gather.
pub struct BootstrapState {
    listener: TcpListener,
    ring: Mutex<BootstrapRing>,
    peer_addrs: Vec<SocketAddr>,
    unexpected_connections: Mutex<Vec<UnexpectedConn>>,
    rank: usize,
    num_ranks: usize,
    magic: u64,
}

async fn bootstrap_net_send(stream: &mut TcpStream, data: &[u8]) -> Result<(), BootstrapError> {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, data.len() as u32);
    stream.write_all(&buf).await?;
    stream.write_all(data).await?;
    Ok(())
}

async fn bootstrap_net_recv(stream: &mut TcpStream, data: &mut [u8]) -> Result<(), BootstrapError> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    let recv_size = LittleEndian::read_u32(&buf);
    if recv_size != data.len() as u32 {
        Err(BootstrapError::RecvSizeMismatch(
            recv_size,
            data.len() as u32,
        ))?;
    }
    stream.read_exact(data).await?;
    Ok(())
}

pub async fn bootstrap_root(listen_sock: Socket, magic: u64) -> Result<(), BootstrapError> {
    listen_sock.listen(16384)?;
    listen_sock.set_nonblocking(true)?;
    let listener: std::net::TcpListener = listen_sock.into();
    let listener = TcpListener::try_from(listener)?;

    let mut recv_buf = [0u8; EXCHANGE_INFO_SEND_SIZE];
    let mut rank_addrs: Vec<Option<SocketAddr>> = Vec::new();
    let mut rank_addrs_root: Vec<Option<SocketAddr>> = Vec::new();
    let mut num_ranks = 0;
    let mut received = 0;

    loop {
        let mut stream = tcp::async_accept(&listener, magic).await?;
        bootstrap_net_recv(&mut stream, recv_buf.as_mut_slice()).await?;
        let info = BootstrapExchangeInfo::decode(&mut recv_buf.as_slice())?;
        if received == 0 {
            num_ranks = info.num_ranks;
            rank_addrs = vec![None; num_ranks];
            rank_addrs_root = vec![None; num_ranks];
        } else if info.num_ranks != num_ranks {
            Err(BootstrapError::NumRanksMismatch(info.num_ranks, num_ranks))?;
        }
        if info.rank >= num_ranks {
            Err(BootstrapError::RankOverflow(info.rank))?;
        }
        if rank_addrs[info.rank].is_some() {
            Err(BootstrapError::DuplicatedCheckIn(info.rank))?;
        }
        rank_addrs[info.rank] = Some(info.listen_addr);
        rank_addrs_root[info.rank] = Some(info.listen_addr_root);
        received += 1;
        log::trace!("Bootstrap root received check-in from rank {}", info.rank);
        if received == num_ranks {
            break;
        }
    }

    // every slot is filled once all ranks checked in
    let rank_addrs: Vec<SocketAddr> = rank_addrs.into_iter().flatten().collect();
    let rank_addrs_root: Vec<SocketAddr> = rank_addrs_root.into_iter().flatten().collect();
    for r in 0..num_ranks {
        let next = (r + 1) % num_ranks;
        log::trace!("Bootstrap root connecting to {:?}", rank_addrs_root[r]);
        let mut stream = tcp::async_connect(&rank_addrs_root[r], magic).await?;
        let mut send_buf = [0u8; SOCK_ADDR_SEND_SIZE];
        tcp::encode_socket_addr(&rank_addrs[next], &mut send_buf.as_mut_slice());
        bootstrap_net_send(&mut stream, send_buf.as_slice()).await?;
    }
    log::trace!("Bootstrap root has sent out all peer addresses");
    Ok(())
}

pub fn bootstrap_create_root(
    listen_addr: &SocketAddr,
) -> Result<(Socket, BootstrapHandle), BootstrapError> {
    let socket = tcp::bind_socket(listen_addr)?;
    let addr = socket.local_addr()?.as_socket().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "bootstrap root is not bound to an inet address",
        )
    })?;
    let magic = rand::random();
    let handle = BootstrapHandle { addr, magic };
    Ok((socket, handle))
}

impl BootstrapState {
    pub async fn init(
        handle: BootstrapHandle,
        listen_addr: SocketAddr,
        rank: usize,
        num_ranks: usize,
    ) -> Result<BootstrapState, BootstrapError> {
        let mut listen_addr = listen_addr.to_owned();
        listen_addr.set_port(0);

        let peer_listener = tcp::async_listen(&listen_addr)?;
        let peer_listen_addr = peer_listener.local_addr()?;
        let root_listener = tcp::async_listen(&listen_addr)?;
        let root_listen_addr = root_listener.local_addr()?;
        log::trace!(
            "Rank {} of {} root listening on {:?}",
            rank,
            num_ranks,
            root_listen_addr
        );

        if num_ranks > 128 {
            let dura = std::time::Duration::from_millis(rank as u64);
            log::trace!("Rank {} delaying connection to root by {} ms", rank, rank);
            smol::Timer::after(dura).await;
        }

        let mut stream = tcp::async_connect(&handle.addr, handle.magic).await?;
        let info = BootstrapExchangeInfo {
            rank,
            num_ranks,
            listen_addr_root: root_listen_addr,
            listen_addr: peer_listen_addr,
        };
        let mut send_buf = [0u8; EXCHANGE_INFO_SEND_SIZE];
        info.encode(&mut send_buf.as_mut_slice());
        bootstrap_net_send(&mut stream, send_buf.as_slice()).await?;

        // root tells us where our ring successor listens
        let mut stream = tcp::async_accept(&root_listener, handle.magic).await?;
        let mut recv_buf = [0u8; SOCK_ADDR_SEND_SIZE];
        bootstrap_net_recv(&mut stream, recv_buf.as_mut_slice()).await?;
        let next_addr = tcp::decode_socket_addr(&mut recv_buf.as_slice())?;

        let mut ring_send = tcp::async_connect(&next_addr, handle.magic).await?;
        let mut ring_recv = tcp::async_accept(&peer_listener, handle.magic).await?;

        let mut all_addrs_buf = vec![0u8; SOCK_ADDR_SEND_SIZE * num_ranks];
        let my_slot =
            &mut all_addrs_buf[rank * SOCK_ADDR_SEND_SIZE..(rank + 1) * SOCK_ADDR_SEND_SIZE];
        tcp::encode_socket_addr(&peer_listen_addr, &mut &mut my_slot[..]);
        ring_all_gather(
            &mut ring_send,
            &mut ring_recv,
            rank,
            num_ranks,
            all_addrs_buf.as_mut_slice(),
        )
        .await?;
        let mut peer_addrs = Vec::with_capacity(num_ranks);
        for slot in all_addrs_buf.chunks_exact(SOCK_ADDR_SEND_SIZE) {
            peer_addrs.push(tcp::decode_socket_addr(&mut &slot[..])?);
        }

        Ok(BootstrapState {
            listener: peer_listener,
            ring: Mutex::new(BootstrapRing {
                ring_send,
                ring_recv,
            }),
            peer_addrs,
            unexpected_connections: Mutex::new(Vec::new()),
            rank,
            num_ranks,
            magic: handle.magic,
        })
    }

    async fn unexpected_dequeue(&self, peer: usize, tag: u32) -> Option<TcpStream> {
        let mut connections = self.unexpected_connections.lock().await;
        let idx = connections
            .iter()
            .position(|c| c.peer == peer && c.tag == tag)?;
        Some(connections.remove(idx).stream)
    }
}

async fn ring_all_gather(
    ring_send: &mut TcpStream,
    ring_recv: &mut TcpStream,
    rank: usize,
    num_ranks: usize,
    data: &mut [u8],
) -> Result<(), BootstrapError> {
    if data.len() % num_ranks != 0 {
        return Err(BootstrapError::AllGatherSize(data.len(), num_ranks));
    }
    let size = data.len() / num_ranks;
    for i in 0..(num_ranks - 1) {
        let recv_slice_idx = (rank + num_ranks - i - 1) % num_ranks;
        let send_slice_idx = (rank + num_ranks - i) % num_ranks;
        // send slice to the right
        let send_data = &data[send_slice_idx * size..(send_slice_idx + 1) * size];
        bootstrap_net_send(ring_send, send_data).await?;
        // recv slice from the left
        let recv_data = &mut data[recv_slice_idx * size..(recv_slice_idx + 1) * size];
        bootstrap_net_recv(ring_recv, recv_data).await?;
    }
    Ok(())
}

#[async_trait]
impl Bootstrap for BootstrapState {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    async fn send(&self, peer: usize, tag: u32, data: &[u8]) -> Result<(), BootstrapError> {
        let addr = self
            .peer_addrs
            .get(peer)
            .ok_or(BootstrapError::PeerOutOfRange(peer, self.num_ranks))?;
        log::trace!(
            "Bootstrap rank {} send to peer {} ({:?}) tag {}",
            self.rank,
            peer,
            addr,
            tag
        );
        let mut stream = tcp::async_connect(addr, self.magic).await?;
        let mut buf = [0u8; 12];
        LittleEndian::write_u64(&mut buf[..8], self.rank as u64);
        LittleEndian::write_u32(&mut buf[8..], tag);
        stream.write_all(&buf).await?;
        bootstrap_net_send(&mut stream, data).await?;
        Ok(())
    }

    async fn recv(&self, peer: usize, tag: u32, data: &mut [u8]) -> Result<(), BootstrapError> {
        if let Some(mut stream) = self.unexpected_dequeue(peer, tag).await {
            return bootstrap_net_recv(&mut stream, data).await;
        }
        loop {
            let mut stream = tcp::async_accept(&self.listener, self.magic).await?;
            let mut buf = [0u8; 12];
            stream.read_exact(&mut buf).await?;
            let recv_peer = LittleEndian::read_u64(&buf[..8]) as usize;
            let recv_tag = LittleEndian::read_u32(&buf[8..]);
            log::trace!(
                "Bootstrap rank {} accepted peer {} tag {} while waiting for peer {} tag {}",
                self.rank,
                recv_peer,
                recv_tag,
                peer,
                tag
            );
            if recv_peer == peer && recv_tag == tag {
                return bootstrap_net_recv(&mut stream, data).await;
            }
            let conn = UnexpectedConn {
                stream,
                peer: recv_peer,
                tag: recv_tag,
            };
            self.unexpected_connections.lock().await.push(conn);
        }
    }

    async fn all_gather(&self, data: &mut [u8]) -> Result<(), BootstrapError> {
        let mut ring = self.ring.lock().await;
        let BootstrapRing {
            ring_send,
            ring_recv,
        } = &mut *ring;
        ring_all_gather(ring_send, ring_recv, self.rank, self.num_ranks, data).await?;
        log::trace!(
            "Bootstrap AllGather done: rank {} of {}, size: {}",
            self.rank,
            self.num_ranks,
            data.len() / self.num_ranks
        );
        Ok(())
    }
}
