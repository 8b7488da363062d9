use std::sync::Arc;

use thiserror::Error;

use super::catalog::TransportCatalog;
use super::channel::{ChannelId, ConnType, PeerConnId, CHANNEL_MAX_CONNS};
use super::coll_net::MAX_LOCAL_RANKS;
use super::handles::{PeerHandles, RoundBuffer};
use super::intent::IntentError;
use super::mirror::MirrorError;
use super::progress::ConnectProgress;
use super::registry::TransportRegistry;
use super::transporter::{
    ConnectHandle, ConnectHandleError, TransportConnect, TransportContext, Transporter,
    TransporterError,
};
use super::MAX_CHANNELS;
use crate::bootstrap::{Bootstrap, BootstrapError};
use crate::comm::topo::{graph_tag, TopoGraph, TopoSystem};
use crate::comm::{Communicator, PeerInfo};

#[derive(Debug, Error)]
pub enum TransportConnectError {
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("Transport {2} failed for rank {0} -> rank {1}: {3}")]
    Transporter(usize, usize, &'static str, #[source] TransporterError),
    #[error("No transport found for rank {0}[{1:x}] -> rank {2}[{3:x}]")]
    NoTransportFound(usize, i64, usize, i64),
    #[error("Connect handle error: {0}")]
    Handle(#[from] ConnectHandleError),
    #[error("Connect intent error: {0}")]
    Intent(#[from] IntentError),
    #[error("Device mirror error: {0}")]
    Mirror(#[from] MirrorError),
    #[error("Channel {0} does not exist")]
    ChannelNotFound(ChannelId),
    #[error("Connection index {0} exceeds the maximum of {}", CHANNEL_MAX_CONNS)]
    ConnIndexOutOfRange(u32),
    #[error("Connection {0:?} not found")]
    ConnectionNotFound(PeerConnId),
    #[error("{0} local ranks exceed the maximum of {}", MAX_LOCAL_RANKS)]
    TooManyLocalRanks(usize),
}

// Walk the transports in priority order, the first one able to connect the pair wins
pub fn select_transport<'r>(
    transports: &'r TransportRegistry,
    topo: &TopoSystem,
    graph: Option<&TopoGraph>,
    my_info: &PeerInfo,
    peer_info: &PeerInfo,
    catalog: &TransportCatalog,
) -> Result<(usize, &'r Arc<dyn Transporter>), TransportConnectError> {
    for (idx, transporter) in transports.iter() {
        if transporter.can_connect(topo, graph, my_info, peer_info, catalog) {
            return Ok((idx, transporter));
        }
    }
    log::warn!(
        "No transport found for rank {}[{:x}] -> rank {}[{:x}]",
        my_info.rank,
        my_info.bus_id,
        peer_info.rank,
        peer_info.bus_id
    );
    Err(TransportConnectError::NoTransportFound(
        my_info.rank,
        my_info.bus_id,
        peer_info.rank,
        peer_info.bus_id,
    ))
}

// Exchange the packed handles of one distance.
// The peer at the same distance in both directions gets a single combined
// send followed by a single combined receive.
async fn exchange_handles(
    bootstrap: &dyn Bootstrap,
    handles: &mut PeerHandles,
    recv_peer: usize,
    send_peer: usize,
    tag: u32,
) -> Result<(), BootstrapError> {
    debug_assert!(handles.is_complete());
    if send_peer == recv_peer {
        if !handles.is_empty() {
            log::trace!(
                "Exchange {} handles with peer {} (tag {:#x})",
                handles.num_handles(),
                send_peer,
                tag
            );
            bootstrap.send(recv_peer, tag, handles.as_bytes()).await?;
            bootstrap.recv(recv_peer, tag, handles.as_bytes_mut()).await?;
            handles.swap_for_symmetric_peer();
        }
    } else {
        log::trace!(
            "Exchange {} recv handles with peer {}, {} send handles with peer {} (tag {:#x})",
            handles.recv_channels(),
            recv_peer,
            handles.send_channels(),
            send_peer,
            tag
        );
        if handles.recv_channels() > 0 {
            bootstrap.send(recv_peer, tag, handles.recv_bytes()).await?;
        }
        if handles.send_channels() > 0 {
            bootstrap.send(send_peer, tag, handles.send_bytes()).await?;
        }
        if handles.send_channels() > 0 {
            bootstrap.recv(send_peer, tag, handles.send_bytes_mut()).await?;
        }
        if handles.recv_channels() > 0 {
            bootstrap.recv(recv_peer, tag, handles.recv_bytes_mut()).await?;
        }
    }
    Ok(())
}

impl Communicator {
    pub(crate) fn transport_context<'a>(
        &'a self,
        graph: Option<&'a TopoGraph>,
    ) -> TransportContext<'a> {
        TransportContext {
            comm_id: self.id,
            rank: self.rank,
            num_ranks: self.num_ranks,
            profile: &self.profile,
            catalog: &self.catalog,
            topo: &self.topo,
            graph,
        }
    }

    // Bookkeeping only: remember that `channel` needs connections from `recv_peers`
    // and to `send_peers` on slot `conn_index`. Self, out of range peers and
    // connectors that are already connected are skipped.
    pub fn record_connect_intent(
        &mut self,
        channel: ChannelId,
        recv_peers: &[usize],
        send_peers: &[usize],
        conn_index: u32,
    ) -> Result<(), TransportConnectError> {
        if channel.0 as usize >= self.channels.len() {
            return Err(TransportConnectError::ChannelNotFound(channel));
        }
        if conn_index as usize >= CHANNEL_MAX_CONNS {
            return Err(TransportConnectError::ConnIndexOutOfRange(conn_index));
        }
        self.intents.check_conn_index(conn_index)?;
        for (conn_type, peers) in [(ConnType::Recv, recv_peers), (ConnType::Send, send_peers)] {
            for &peer in peers {
                if peer >= self.num_ranks
                    || peer == self.rank
                    || self.is_connected(channel, peer, conn_type, conn_index)
                {
                    continue;
                }
                self.intents.record(conn_type, peer, channel, conn_index)?;
            }
        }
        Ok(())
    }

    /// Connect every recorded intent on slot `conn_index`.
    ///
    /// Peers are visited by ring distance, handles are buffered for at most
    /// `max_peers` distances before the round is drained. Returns the highest
    /// priority index among the transports that were set up, `None` when there
    /// was nothing to set up. Every queued descriptor copy is joined before
    /// returning, on success and failure alike.
    pub async fn establish_connections(
        &mut self,
        graph: Option<&TopoGraph>,
        conn_index: u32,
        max_peers: usize,
    ) -> Result<Option<usize>, TransportConnectError> {
        let result = self.establish_rounds(graph, conn_index, max_peers).await;
        let synced = self.dev_mirror.synchronize().await;
        let highest = result?;
        synced?;
        Ok(highest)
    }

    async fn establish_rounds(
        &mut self,
        graph: Option<&TopoGraph>,
        conn_index: u32,
        max_peers: usize,
    ) -> Result<Option<usize>, TransportConnectError> {
        if conn_index as usize >= CHANNEL_MAX_CONNS {
            return Err(TransportConnectError::ConnIndexOutOfRange(conn_index));
        }
        self.intents.check_conn_index(conn_index)?;

        let rank = self.rank;
        let num_ranks = self.num_ranks;
        let bootstrap = Arc::clone(&self.bootstrap);
        let graph_tag = graph_tag(graph);
        let mut progress = ConnectProgress::new(self.connect_config.report_progress && rank == 0);
        let mut round = RoundBuffer::new(max_peers);
        let mut highest: Option<usize> = None;
        let mut done = 0;
        self.drain_passes.clear();

        for i in 1..num_ranks {
            let tag = ((i as u32) << 8) + graph_tag;
            let recv_peer = (rank + num_ranks - i) % num_ranks;
            let send_peer = (rank + i) % num_ranks;
            let recv_mask = self.intents.recv_mask(recv_peer);
            let send_mask = self.intents.send_mask(send_peer);

            let mut handles = PeerHandles::new(i, recv_mask.count(), send_mask.count());
            for channel in recv_mask.iter() {
                let (handle, idx) =
                    self.setup_connector(graph, channel, recv_peer, ConnType::Recv, conn_index)?;
                highest = highest.max(idx);
                handles.push_recv(&handle);
            }
            for channel in send_mask.iter() {
                let (handle, idx) =
                    self.setup_connector(graph, channel, send_peer, ConnType::Send, conn_index)?;
                highest = highest.max(idx);
                handles.push_send(&handle);
            }
            exchange_handles(&*bootstrap, &mut handles, recv_peer, send_peer, tag).await?;
            round.push(handles);

            if round.is_full() || i == num_ranks - 1 {
                let passes = self
                    .drain_round(graph, &round, conn_index, &mut progress, done)
                    .await?;
                log::debug!(
                    "Rank {}: distances {}..={} connected after {} passes",
                    rank,
                    done + 1,
                    i,
                    passes
                );
                self.drain_passes.push(passes);
                round.clear();
                done = i;
            }
        }

        if self.connect_config.report_progress && rank == 0 {
            log::info!("{}", progress.summary());
        } else {
            log::debug!("Rank {}: {}", rank, progress.summary());
        }

        self.termination_barrier(&*bootstrap, graph_tag).await?;
        Ok(highest)
    }

    // Select the transport of one connector and run its setup.
    // A connector connected by an earlier call keeps its slot in the packed
    // handles with an empty handle.
    fn setup_connector(
        &mut self,
        graph: Option<&TopoGraph>,
        channel: ChannelId,
        peer: usize,
        conn_type: ConnType,
        conn_index: u32,
    ) -> Result<(ConnectHandle, Option<usize>), TransportConnectError> {
        let conn_id = PeerConnId {
            peer_rank: peer,
            channel,
            conn_index,
            conn_type,
        };
        let connector = self
            .connector(channel, peer, conn_type, conn_index)
            .ok_or(TransportConnectError::ConnectionNotFound(conn_id))?;
        if connector.is_connected() {
            return Ok((ConnectHandle::zeroed(), None));
        }

        let my_info = &self.peers_info[self.rank];
        let peer_info = &self.peers_info[peer];
        let (idx, transporter) = select_transport(
            &self.transports,
            &self.topo,
            graph,
            my_info,
            peer_info,
            &self.catalog,
        )?;
        let transporter = Arc::clone(transporter);
        let ctx = self.transport_context(graph);
        let setup = match conn_type {
            ConnType::Send => transporter.send_setup(&ctx, &conn_id, my_info, peer_info),
            ConnType::Recv => transporter.recv_setup(&ctx, &conn_id, my_info, peer_info),
        }
        .map_err(|err| {
            TransportConnectError::Transporter(self.rank, peer, transporter.name(), err)
        })?;
        let (src, dst) = match conn_type {
            ConnType::Send => (self.rank, peer),
            ConnType::Recv => (peer, self.rank),
        };
        log::info!(
            "Channel {:02}/{} : {}[{:x}] -> {}[{:x}] [{}] via {}",
            channel.0,
            conn_index,
            src,
            self.peers_info[src].bus_id,
            dst,
            self.peers_info[dst].bus_id,
            conn_type,
            transporter.name()
        );

        let rank = self.rank;
        let name = transporter.name();
        let connector = self.channels[channel.0 as usize].peers[peer]
            .connector_mut(conn_type, conn_index)
            .ok_or(TransportConnectError::ConnectionNotFound(conn_id))?;
        connector
            .assign(&conn_id, transporter, idx, setup.resources)
            .map_err(|err| TransportConnectError::Transporter(rank, peer, name, err))?;
        Ok((setup.handle, Some(idx)))
    }

    // Ok(true) once the connector is live
    fn connect_connector(
        &mut self,
        graph: Option<&TopoGraph>,
        conn_id: PeerConnId,
        handle: ConnectHandle,
    ) -> Result<bool, TransportConnectError> {
        let Communicator {
            id,
            rank,
            num_ranks,
            profile,
            catalog,
            topo,
            channels,
            dev_mirror,
            ..
        } = self;
        let connector = channels
            .get_mut(conn_id.channel.0 as usize)
            .and_then(|c| c.peers.get_mut(conn_id.peer_rank))
            .and_then(|p| p.connector_mut(conn_id.conn_type, conn_id.conn_index))
            .ok_or(TransportConnectError::ConnectionNotFound(conn_id))?;
        if connector.is_connected() {
            return Ok(true);
        }
        let transporter = connector
            .transporter()
            .cloned()
            .ok_or(TransportConnectError::ConnectionNotFound(conn_id))?;
        let resources = connector
            .resources_mut()
            .ok_or(TransportConnectError::ConnectionNotFound(conn_id))?;
        let ctx = TransportContext {
            comm_id: *id,
            rank: *rank,
            num_ranks: *num_ranks,
            profile: &*profile,
            catalog: &**catalog,
            topo: &*topo,
            graph,
        };
        let mut peer_handles = [handle];
        let connected = match conn_id.conn_type {
            ConnType::Send => {
                transporter.send_connect(&ctx, &conn_id, &mut peer_handles, 0, resources)
            }
            ConnType::Recv => {
                transporter.recv_connect(&ctx, &conn_id, &mut peer_handles, 0, resources)
            }
        }
        .map_err(|err| {
            TransportConnectError::Transporter(*rank, conn_id.peer_rank, transporter.name(), err)
        })?;
        match connected {
            TransportConnect::Connected(conn_info) => {
                connector.mark_connected(conn_info);
                dev_mirror.publish(conn_id, connector.conn_info)?;
                Ok(true)
            }
            TransportConnect::InProgress => Ok(false),
        }
    }

    // Connect every connector of the round, rescanning the whole round
    // until no transport reports progress pending. Returns the number of passes.
    async fn drain_round(
        &mut self,
        graph: Option<&TopoGraph>,
        round: &RoundBuffer,
        conn_index: u32,
        progress: &mut ConnectProgress,
        done: usize,
    ) -> Result<usize, TransportConnectError> {
        let rank = self.rank;
        let num_ranks = self.num_ranks;
        let mut passes = 0;
        loop {
            passes += 1;
            let mut all_connected = true;
            for handles in round.iter() {
                let recv_peer = (rank + num_ranks - handles.distance) % num_ranks;
                let send_peer = (rank + handles.distance) % num_ranks;
                let recv_mask = self.intents.recv_mask(recv_peer);
                let send_mask = self.intents.send_mask(send_peer);
                let mut send_k = 0;
                let mut recv_k = 0;
                for c in 0..MAX_CHANNELS as u32 {
                    let channel = ChannelId(c);
                    if send_mask.contains(channel) {
                        let conn_id = PeerConnId {
                            peer_rank: send_peer,
                            channel,
                            conn_index,
                            conn_type: ConnType::Send,
                        };
                        let handle = handles.send_handle(send_k);
                        send_k += 1;
                        all_connected &= self.connect_connector(graph, conn_id, handle)?;
                    }
                    if recv_mask.contains(channel) {
                        let conn_id = PeerConnId {
                            peer_rank: recv_peer,
                            channel,
                            conn_index,
                            conn_type: ConnType::Recv,
                        };
                        let handle = handles.recv_handle(recv_k);
                        recv_k += 1;
                        all_connected &= self.connect_connector(graph, conn_id, handle)?;
                    }
                }
            }
            progress.report(done, num_ranks);
            if all_connected {
                return Ok(passes);
            }
            smol::future::yield_now().await;
        }
    }

    // Both sides of every pair observe completion before intents are dropped,
    // so no rank releases negotiation state its peer is still importing
    async fn termination_barrier(
        &mut self,
        bootstrap: &dyn Bootstrap,
        graph_tag: u32,
    ) -> Result<(), TransportConnectError> {
        let rank = self.rank;
        let num_ranks = self.num_ranks;
        let flag = [0u8; 4];
        let mut peer_flag = [0u8; 4];
        for i in 1..num_ranks {
            let tag = ((i as u32) << 8) + (1 << 7) + graph_tag;
            let recv_peer = (rank + num_ranks - i) % num_ranks;
            let send_peer = (rank + i) % num_ranks;
            let has_send = !self.intents.send_mask(send_peer).is_empty();
            let has_recv = !self.intents.recv_mask(recv_peer).is_empty();

            if recv_peer != send_peer {
                if has_send {
                    bootstrap.send(send_peer, tag, &flag).await?;
                }
                if has_recv {
                    bootstrap.send(recv_peer, tag, &flag).await?;
                }
                if has_send {
                    bootstrap.recv(send_peer, tag, &mut peer_flag).await?;
                }
                if has_recv {
                    bootstrap.recv(recv_peer, tag, &mut peer_flag).await?;
                }
            } else if has_send || has_recv {
                bootstrap.send(send_peer, tag, &flag).await?;
                bootstrap.recv(send_peer, tag, &mut peer_flag).await?;
            }
            self.intents.clear_recv(recv_peer);
            self.intents.clear_send(send_peer);
        }
        log::trace!("Rank {} passed the connect termination barrier", rank);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::comm::topo::LinkType;
    use crate::comm::HostIdent;
    use crate::transport::registry::{NET_TRANSPORT_IDX, P2P_TRANSPORT_IDX};
    use crate::transport::transporter::{AnyResources, TransportSetup};

    struct Nothing;

    impl Transporter for Nothing {
        fn name(&self) -> &'static str {
            "NOTHING"
        }

        fn send_setup(
            &self,
            _: &TransportContext,
            _: &PeerConnId,
            _: &PeerInfo,
            _: &PeerInfo,
        ) -> Result<TransportSetup, TransporterError> {
            unreachable!()
        }

        fn recv_setup(
            &self,
            _: &TransportContext,
            _: &PeerConnId,
            _: &PeerInfo,
            _: &PeerInfo,
        ) -> Result<TransportSetup, TransporterError> {
            unreachable!()
        }

        fn send_connect(
            &self,
            _: &TransportContext,
            _: &PeerConnId,
            _: &mut [ConnectHandle],
            _: usize,
            _: &mut AnyResources,
        ) -> Result<TransportConnect, TransporterError> {
            unreachable!()
        }

        fn recv_connect(
            &self,
            _: &TransportContext,
            _: &PeerConnId,
            _: &mut [ConnectHandle],
            _: usize,
            _: &mut AnyResources,
        ) -> Result<TransportConnect, TransporterError> {
            unreachable!()
        }
    }

    fn peer(rank: usize, host: &str) -> PeerInfo {
        PeerInfo::new(rank, HostIdent::new(host), IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn selection_is_deterministic() {
        let registry = TransportRegistry::builtin();
        let catalog = TransportCatalog::new();
        let mut topo = TopoSystem::new();
        topo.set_link(0, 1, LinkType::NvLink);
        let (a, b, c) = (peer(0, "h0"), peer(1, "h0"), peer(2, "h1"));
        for _ in 0..8 {
            let (idx, t) = select_transport(&registry, &topo, None, &a, &b, &catalog).unwrap();
            assert_eq!((idx, t.name()), (P2P_TRANSPORT_IDX, "P2P"));
            let (idx, t) = select_transport(&registry, &topo, None, &a, &c, &catalog).unwrap();
            assert_eq!((idx, t.name()), (NET_TRANSPORT_IDX, "NET"));
        }
    }

    #[test]
    fn no_capable_transport_names_both_ranks() {
        let registry = TransportRegistry::new(vec![Arc::new(Nothing)]);
        let catalog = TransportCatalog::new();
        let topo = TopoSystem::new();
        let mut a = peer(3, "h0");
        a.bus_id = 0x1a;
        let b = peer(5, "h1");
        let err = select_transport(&registry, &topo, None, &a, &b, &catalog).unwrap_err();
        assert!(matches!(err, TransportConnectError::NoTransportFound(3, 0x1a, 5, 5)));
        assert_eq!(
            err.to_string(),
            "No transport found for rank 3[1a] -> rank 5[5]"
        );
    }
}
