#![allow(dead_code)]

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use mccs_connect::bootstrap::{Bootstrap, LocalBootstrapFabric};
use mccs_connect::comm::topo::{TopoGraph, TopoSystem};
use mccs_connect::comm::{HostIdent, PeerInfo};
use mccs_connect::transport::catalog::TransportCatalog;
use mccs_connect::transport::channel::{ConnType, PeerConnId};
use mccs_connect::transport::connector::{ConnDescriptor, ConnFlags};
use mccs_connect::transport::transporter::{
    AnyResources, ConnectHandle, TransportConnect, TransportContext, TransportSetup, Transporter,
    TransporterError,
};

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn peers(hosts: &[&str]) -> Vec<PeerInfo> {
    hosts
        .iter()
        .enumerate()
        .map(|(rank, host)| PeerInfo::new(rank, HostIdent::new(host), IpAddr::V4(Ipv4Addr::LOCALHOST)))
        .collect()
}

// One OS thread per rank over an in-process bootstrap fabric
pub fn run_ranks<T, F, Fut>(num_ranks: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(usize, Arc<dyn Bootstrap>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T>,
{
    init_log();
    let fabric = LocalBootstrapFabric::new(num_ranks);
    let f = Arc::new(f);
    let handles: Vec<_> = (0..num_ranks)
        .map(|rank| {
            let f = Arc::clone(&f);
            let bootstrap: Arc<dyn Bootstrap> = Arc::new(fabric.endpoint(rank));
            std::thread::Builder::new()
                .name(format!("rank-{}", rank))
                .spawn(move || smol::block_on(f(rank, bootstrap)))
                .unwrap()
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct LoopbackHandle {
    rank: usize,
    channel: u32,
    sender: bool,
}

/// Backend that is capable for every pair and checks that each connect
/// receives the handle its peer produced for the same channel.
#[derive(Default)]
pub struct LoopbackTransport {
    // report InProgress once per connector before connecting
    pub lazy: bool,
    // fail the connect that follows the InProgress answer
    pub fail_on_retry: bool,
    pub setups: AtomicUsize,
    pub connects: AtomicUsize,
}

impl LoopbackTransport {
    pub fn new(lazy: bool) -> Arc<Self> {
        Arc::new(LoopbackTransport {
            lazy,
            ..Default::default()
        })
    }

    pub fn failing_on_retry() -> Arc<Self> {
        Arc::new(LoopbackTransport {
            lazy: true,
            fail_on_retry: true,
            ..Default::default()
        })
    }

    pub fn setups(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn setup(&self, ctx: &TransportContext, conn_id: &PeerConnId) -> Result<TransportSetup, TransporterError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        let handle = LoopbackHandle {
            rank: ctx.rank,
            channel: conn_id.channel.0,
            sender: conn_id.conn_type == ConnType::Send,
        };
        Ok(TransportSetup {
            handle: ConnectHandle::serialize_from(handle)?,
            resources: Box::new(false),
        })
    }

    fn connect(
        &self,
        conn_id: &PeerConnId,
        handles: &mut [ConnectHandle],
        origin: usize,
        resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let handle: LoopbackHandle = handles[origin].deserialize_to()?;
        let expect_sender = conn_id.conn_type == ConnType::Recv;
        if handle.rank != conn_id.peer_rank
            || handle.channel != conn_id.channel.0
            || handle.sender != expect_sender
        {
            anyhow::bail!("{:?} received a foreign handle {:?}", conn_id, handle);
        }
        let attempted = resources
            .downcast_mut::<bool>()
            .ok_or_else(|| anyhow::anyhow!("unexpected resources"))?;
        if self.lazy && !*attempted {
            *attempted = true;
            return Ok(TransportConnect::InProgress);
        }
        if self.fail_on_retry {
            anyhow::bail!("{:?} failed after reporting progress", conn_id);
        }
        Ok(TransportConnect::Connected(ConnDescriptor {
            flags: ConnFlags::DIRECT,
            step: conn_id.peer_rank as u64,
            ..Default::default()
        }))
    }
}

impl Transporter for LoopbackTransport {
    fn name(&self) -> &'static str {
        "LOOPBACK"
    }

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
        conn_id: &PeerConnId,
        _my_info: &PeerInfo,
        _peer_info: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError> {
        self.setup(ctx, conn_id)
    }

    fn recv_setup(
        &self,
        ctx: &TransportContext,
        conn_id: &PeerConnId,
        _my_info: &PeerInfo,
        _peer_info: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError> {
        self.setup(ctx, conn_id)
    }

    fn send_connect(
        &self,
        _ctx: &TransportContext,
        conn_id: &PeerConnId,
        handles: &mut [ConnectHandle],
        origin: usize,
        resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        self.connect(conn_id, handles, origin, resources)
    }

    fn recv_connect(
        &self,
        _ctx: &TransportContext,
        conn_id: &PeerConnId,
        handles: &mut [ConnectHandle],
        origin: usize,
        resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        self.connect(conn_id, handles, origin, resources)
    }
}

/// Backend that never accepts a pair.
pub struct RefusingTransport;

impl Transporter for RefusingTransport {
    fn name(&self) -> &'static str {
        "REFUSING"
    }

    fn send_setup(
        &self,
        _: &TransportContext,
        _: &PeerConnId,
        _: &PeerInfo,
        _: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError> {
        anyhow::bail!("not capable")
    }

    fn recv_setup(
        &self,
        _: &TransportContext,
        _: &PeerConnId,
        _: &PeerInfo,
        _: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError> {
        anyhow::bail!("not capable")
    }

    fn send_connect(
        &self,
        _: &TransportContext,
        _: &PeerConnId,
        _: &mut [ConnectHandle],
        _: usize,
        _: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        anyhow::bail!("not capable")
    }

    fn recv_connect(
        &self,
        _: &TransportContext,
        _: &PeerConnId,
        _: &mut [ConnectHandle],
        _: usize,
        _: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        anyhow::bail!("not capable")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RootHandle {
    rank: usize,
    reply: bool,
}

/// Collective network backend that records who set up, connected and freed
/// the root connectors.
#[derive(Default)]
pub struct RecordingCollNet {
    pub setup_ranks: Mutex<Vec<usize>>,
    pub connect_ranks: Mutex<Vec<usize>>,
    // (rank, origin, ranks behind the master handles) of every recv connect
    pub recv_connects: Mutex<Vec<(usize, usize, Vec<usize>)>>,
    pub frees: AtomicUsize,
}

impl RecordingCollNet {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingCollNet::default())
    }

    pub fn setup_ranks(&self) -> Vec<usize> {
        self.setup_ranks.lock().unwrap().clone()
    }

    pub fn connect_ranks(&self) -> Vec<usize> {
        self.connect_ranks.lock().unwrap().clone()
    }

    pub fn recv_connects(&self) -> Vec<(usize, usize, Vec<usize>)> {
        self.recv_connects.lock().unwrap().clone()
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    fn setup(&self, ctx: &TransportContext) -> Result<TransportSetup, TransporterError> {
        self.setup_ranks.lock().unwrap().push(ctx.rank);
        let handle = RootHandle {
            rank: ctx.rank,
            reply: false,
        };
        Ok(TransportSetup {
            handle: ConnectHandle::serialize_from(handle)?,
            resources: Box::new(()),
        })
    }

    fn connected() -> TransportConnect {
        TransportConnect::Connected(ConnDescriptor {
            flags: ConnFlags::COLL_NET,
            ..Default::default()
        })
    }
}

impl Transporter for RecordingCollNet {
    fn name(&self) -> &'static str {
        "RECORDING_COLLNET"
    }

    fn send_setup(
        &self,
        ctx: &TransportContext,
        _conn_id: &PeerConnId,
        _my_info: &PeerInfo,
        _peer_info: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError> {
        self.setup(ctx)
    }

    fn recv_setup(
        &self,
        ctx: &TransportContext,
        _conn_id: &PeerConnId,
        _my_info: &PeerInfo,
        _peer_info: &PeerInfo,
    ) -> Result<TransportSetup, TransporterError> {
        self.setup(ctx)
    }

    fn send_connect(
        &self,
        ctx: &TransportContext,
        _conn_id: &PeerConnId,
        handles: &mut [ConnectHandle],
        origin: usize,
        _resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        self.connect_ranks.lock().unwrap().push(ctx.rank);
        let reply: RootHandle = handles
            .get(origin)
            .ok_or_else(|| anyhow::anyhow!("no handle at {}", origin))?
            .deserialize_to()?;
        if !reply.reply {
            anyhow::bail!("rank {} got no reply from its recv master", ctx.rank);
        }
        Ok(Self::connected())
    }

    fn recv_connect(
        &self,
        ctx: &TransportContext,
        _conn_id: &PeerConnId,
        handles: &mut [ConnectHandle],
        origin: usize,
        _resources: &mut AnyResources,
    ) -> Result<TransportConnect, TransporterError> {
        self.connect_ranks.lock().unwrap().push(ctx.rank);
        let masters = handles
            .iter()
            .map(|handle| handle.deserialize_to::<RootHandle>().map(|h| h.rank))
            .collect::<Result<Vec<_>, _>>()?;
        self.recv_connects
            .lock()
            .unwrap()
            .push((ctx.rank, origin, masters));
        let reply = RootHandle {
            rank: ctx.rank,
            reply: true,
        };
        handles[origin] = ConnectHandle::serialize_from(reply)?;
        Ok(Self::connected())
    }

    fn free(&self, _conn_id: &PeerConnId, _resources: AnyResources) -> Result<(), TransporterError> {
        self.frees.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
