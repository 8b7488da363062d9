use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use structopt::StructOpt;

use mccs_connect::bootstrap::{
    bootstrap_create_root, bootstrap_root, Bootstrap, BootstrapHandle, BootstrapState,
    LocalBootstrapFabric,
};
use mccs_connect::comm::{CommProfile, Communicator, CommunicatorId, HostIdent, PeerInfo};
use mccs_connect::config::Config;
use mccs_connect::transport::catalog::TransportCatalog;
use mccs_connect::transport::channel::{ChannelId, ConnType};
use mccs_connect::CollNetSetup;

use chrono::Timelike;
use env_logger::fmt::Color;
use std::io::Write;

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "mCCS connect")]
struct Opts {
    /// Config path, built-in defaults when absent
    #[structopt(short, long)]
    config: Option<PathBuf>,
    /// Number of simulated ranks
    #[structopt(short, long, default_value = "4")]
    ranks: usize,
    /// Number of simulated hosts, ranks are spread round-robin
    #[structopt(long, default_value = "1")]
    hosts: usize,
    /// Overrides the configured channel count
    #[structopt(long)]
    channels: Option<u32>,
    /// Rendezvous over TCP on the loopback interface instead of in-process mailboxes
    #[structopt(long)]
    tcp_bootstrap: bool,
    /// Build the collective network path after the ring is connected
    #[structopt(long)]
    coll_net: bool,
}

enum Rendezvous {
    Local(Arc<LocalBootstrapFabric>),
    Tcp(BootstrapHandle),
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let time = chrono::Local::now();
            let style = buf
                .style()
                .set_color(Color::Black)
                .set_intense(true)
                .clone();
            let time = format!(
                "{:02}:{:02}:{:02}.{:03}",
                time.hour() % 24,
                time.minute(),
                time.second(),
                time.timestamp_subsec_millis()
            );
            writeln!(
                buf,
                "{}{} {} {}{} {}",
                style.value("["),
                time,
                buf.default_styled_level(record.level()),
                record.module_path().unwrap_or(""),
                style.value("]"),
                record.args()
            )
        })
        .init();
}

async fn run_rank(
    rank: usize,
    peers_info: Vec<PeerInfo>,
    rendezvous: Arc<Rendezvous>,
    config: Arc<Config>,
    catalog: Arc<TransportCatalog>,
    opts: Arc<Opts>,
) -> Result<()> {
    let num_ranks = peers_info.len();
    let bootstrap: Arc<dyn Bootstrap> = match rendezvous.as_ref() {
        Rendezvous::Local(fabric) => Arc::new(fabric.endpoint(rank)),
        Rendezvous::Tcp(handle) => {
            let listen_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
            let state = BootstrapState::init(handle.clone(), listen_addr, rank, num_ranks).await?;
            Arc::new(state)
        }
    };
    let num_channels = opts
        .channels
        .unwrap_or(config.comm_default_config.channel_count) as usize;
    let profile = CommProfile {
        buff_sizes: config.comm_default_config.buf_sizes,
    };
    let mut comm = Communicator::new(
        CommunicatorId(0),
        rank,
        peers_info,
        num_channels,
        bootstrap,
        catalog,
    )?
    .with_profile(profile)
    .with_connect_config(config.connect.clone());

    // ring: receive from the previous rank, send to the next
    let prev = (rank + num_ranks - 1) % num_ranks;
    let next = (rank + 1) % num_ranks;
    for channel in 0..num_channels {
        comm.record_connect_intent(ChannelId(channel as u32), &[prev], &[next], 0)?;
    }
    let max_peers = comm.connect_config.round_max_peers;
    comm.establish_connections(None, 0, max_peers).await?;

    for channel in 0..num_channels {
        let channel = ChannelId(channel as u32);
        let transport = comm
            .connector(channel, next, ConnType::Send, 0)
            .and_then(|c| c.transporter())
            .map_or("none", |t| t.name());
        log::debug!(
            "Rank {} channel {} ring send to {} uses {}",
            rank,
            channel,
            next,
            transport
        );
    }

    if opts.coll_net {
        // first local rank receives from the root, last local rank sends to it
        let recv_master = comm.local_rank_to_rank[0];
        let send_master = comm.local_rank_to_rank[comm.num_local_ranks() - 1];
        let mut setup_failed = false;
        for channel in 0..num_channels {
            let setup = comm
                .connect_coll_net_channel(ChannelId(channel as u32), None, recv_master, send_master)
                .await;
            setup_failed |= setup == CollNetSetup::Fail;
        }
        let node_failed = comm.check_coll_net(setup_failed).await?;
        let failed = comm.agree_coll_net(node_failed).await?;
        if rank == 0 {
            log::info!(
                "CollNet {}",
                if failed { "disabled" } else { "connected" }
            );
        }
    }

    comm.teardown_all_coll_net()?;
    comm.free_peer_connections()?;
    Ok(())
}

fn main() -> Result<()> {
    better_panic::install();
    let opts = Opts::from_args();
    init_logger();
    let mut config = match &opts.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    if opts.coll_net {
        config.comm_global_config.coll_net_config.enable = true;
    }
    config.apply_env_overrides()?;
    if opts.ranks == 0 || opts.hosts == 0 {
        anyhow::bail!("at least one rank on one host is required");
    }

    let catalog = Arc::new(TransportCatalog::new());
    config.register_transport_configs(&catalog);

    let peers_info: Vec<PeerInfo> = (0..opts.ranks)
        .map(|rank| {
            let host = HostIdent(format!("host-{}", rank % opts.hosts));
            PeerInfo::new(rank, host, IpAddr::V4(Ipv4Addr::LOCALHOST))
        })
        .collect();

    let mut root = None;
    let rendezvous = if opts.tcp_bootstrap {
        let listen_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let (socket, handle) = bootstrap_create_root(&listen_addr)?;
        let magic = handle.magic;
        root = Some(std::thread::spawn(move || {
            smol::block_on(bootstrap_root(socket, magic))
        }));
        Rendezvous::Tcp(handle)
    } else {
        Rendezvous::Local(LocalBootstrapFabric::new(opts.ranks))
    };
    let rendezvous = Arc::new(rendezvous);
    let config = Arc::new(config);
    let opts = Arc::new(opts);

    log::info!(
        "Connecting {} ranks over {} hosts",
        opts.ranks,
        opts.hosts
    );
    let handles: Vec<_> = (0..opts.ranks)
        .map(|rank| {
            let peers_info = peers_info.clone();
            let rendezvous = Arc::clone(&rendezvous);
            let config = Arc::clone(&config);
            let catalog = Arc::clone(&catalog);
            let opts = Arc::clone(&opts);
            std::thread::Builder::new()
                .name(format!("rank-{}", rank))
                .spawn(move || {
                    smol::block_on(run_rank(rank, peers_info, rendezvous, config, catalog, opts))
                })
        })
        .collect::<std::io::Result<_>>()?;

    let mut failed = 0;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::error!("Rank {} failed: {:?}", rank, err);
                failed += 1;
            }
            Err(_) => {
                log::error!("Rank {} panicked", rank);
                failed += 1;
            }
        }
    }
    if let Some(root) = root {
        match root.join() {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("bootstrap root panicked"),
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} ranks failed", failed, opts.ranks);
    }
    log::info!("All ranks connected");
    Ok(())
}
