mod common;

use std::sync::Arc;

use common::{peers, run_ranks, RecordingCollNet};
use mccs_connect::bootstrap::Bootstrap;
use mccs_connect::comm::{Communicator, CommunicatorId};
use mccs_connect::config::ConnectConfig;
use mccs_connect::transport::catalog::TransportCatalog;
use mccs_connect::transport::channel::{ChannelId, ConnType, PeerConnId};
use mccs_connect::transport::coll_net::config::CollNetConfig;
use mccs_connect::transport::registry::TransportRegistry;
use mccs_connect::transport::transporter::Transporter;
use mccs_connect::CollNetSetup;

fn catalog(enable: bool) -> Arc<TransportCatalog> {
    let catalog = Arc::new(TransportCatalog::new());
    catalog.register_config("CollNetTransport".to_string(), CollNetConfig { enable });
    catalog
}

fn recording_comm(
    id: u32,
    rank: usize,
    hosts: &[&str],
    bootstrap: Arc<dyn Bootstrap>,
    catalog: Arc<TransportCatalog>,
    coll_net: Arc<RecordingCollNet>,
) -> Communicator {
    let registry = TransportRegistry::new(Vec::new()).with_coll_net(coll_net as Arc<dyn Transporter>);
    Communicator::new(CommunicatorId(id), rank, peers(hosts), 1, bootstrap, catalog)
        .unwrap()
        .with_transports(registry)
}

#[test]
fn masters_connect_the_root_and_release_it_once() {
    const HOSTS: [&str; 4] = ["a", "b", "a", "b"];
    let catalog = catalog(true);
    let results = run_ranks(4, move |rank, bootstrap| {
        let catalog = Arc::clone(&catalog);
        async move {
            let mut comm = Communicator::new(
                CommunicatorId(3),
                rank,
                peers(&HOSTS),
                2,
                bootstrap,
                catalog,
            )
            .unwrap()
            .with_connect_config(ConnectConfig {
                round_max_peers: 128,
                report_progress: false,
            });
            let recv_master = comm.local_rank_to_rank[0];
            let send_master = comm.local_rank_to_rank[comm.num_local_ranks() - 1];
            let mut setup_failed = false;
            for c in 0..2 {
                let setup = comm
                    .connect_coll_net_channel(ChannelId(c), None, recv_master, send_master)
                    .await;
                setup_failed |= setup == CollNetSetup::Fail;
            }
            assert!(!setup_failed);
            assert!(!comm.check_coll_net(setup_failed).await.unwrap());
            assert!(!comm.agree_coll_net(false).await.unwrap());
            assert!(comm.coll_net_supported());

            let root_desc = comm.dev_mirror.get(&PeerConnId {
                peer_rank: comm.coll_net_root_rank(),
                channel: ChannelId(0),
                conn_index: 0,
                conn_type: ConnType::Recv,
            });
            assert_eq!(root_desc.is_some(), rank == recv_master);

            // local ranks of a node leave one after another
            comm.bootstrap
                .barrier(&[0, 1, 2, 3], rank, 0x7d00_0000)
                .await
                .unwrap();
            let released = comm.teardown_all_coll_net().unwrap();
            assert_eq!(comm.teardown_all_coll_net().unwrap(), 0);
            released
        }
    });
    // every (node, channel) root is freed by exactly one local rank
    assert_eq!(results.iter().sum::<usize>(), 2 * 2);
}

#[test]
fn disabled_collnet_falls_back_on_every_rank() {
    const HOSTS: [&str; 6] = ["a", "a", "a", "b", "b", "b"];
    let catalog = catalog(false);
    let results = run_ranks(6, move |rank, bootstrap| {
        let catalog = Arc::clone(&catalog);
        async move {
            let mut comm = Communicator::new(
                CommunicatorId(4),
                rank,
                peers(&HOSTS),
                1,
                bootstrap,
                catalog,
            )
            .unwrap();
            let recv_master = comm.local_rank_to_rank[0];
            let send_master = comm.local_rank_to_rank[comm.num_local_ranks() - 1];
            let setup = comm
                .connect_coll_net_channel(ChannelId(0), None, recv_master, send_master)
                .await;
            let node_failed = comm.check_coll_net(setup == CollNetSetup::Fail).await.unwrap();
            let failed = comm.agree_coll_net(node_failed).await.unwrap();
            (rank, setup, node_failed, failed, comm.coll_net_supported())
        }
    });
    for (rank, setup, node_failed, failed, supported) in results {
        // ranks 1 and 4 are neither recv nor send master
        let is_master = ![1, 4].contains(&rank);
        assert_eq!(setup == CollNetSetup::Fail, is_master);
        assert!(node_failed);
        assert!(failed);
        assert!(!supported);
    }
}

#[test]
fn one_failing_node_disables_collnet_everywhere() {
    const HOSTS: [&str; 4] = ["a", "a", "b", "b"];
    let results = run_ranks(4, |rank, bootstrap| async move {
        let mut comm = Communicator::new(
            CommunicatorId(5),
            rank,
            peers(&HOSTS),
            1,
            bootstrap,
            Arc::new(TransportCatalog::new()),
        )
        .unwrap();
        // only node "b" reports a failed setup
        let node_failed = comm.check_coll_net(rank == 3).await.unwrap();
        let failed = comm.agree_coll_net(node_failed).await.unwrap();
        (node_failed, failed)
    });
    assert_eq!(
        results,
        vec![(false, true), (false, true), (true, true), (true, true)]
    );
}

#[test]
fn recv_masters_out_of_node_order_use_node_slots() {
    const HOSTS: [&str; 4] = ["a", "b", "a", "b"];
    let coll_net = RecordingCollNet::new();
    let catalog = catalog(true);
    let recorder = Arc::clone(&coll_net);
    let results = run_ranks(4, move |rank, bootstrap| {
        let catalog = Arc::clone(&catalog);
        let coll_net = Arc::clone(&coll_net);
        async move {
            let comm = recording_comm(6, rank, &HOSTS, bootstrap, catalog, coll_net);
            // node 0 is led by its last rank and node 1 by its first,
            // so rank order and node order of the masters disagree
            let master = if comm.node == 0 {
                comm.local_rank_to_rank[comm.num_local_ranks() - 1]
            } else {
                comm.local_rank_to_rank[0]
            };
            comm.connect_coll_net_channel(ChannelId(0), None, master, master)
                .await
        }
    });
    assert!(results.iter().all(|&setup| setup == CollNetSetup::Success));

    let mut recv_connects = recorder.recv_connects();
    recv_connects.sort();
    // each master connects with its node as origin, handles indexed by node
    assert_eq!(
        recv_connects,
        vec![(1, 1, vec![2, 1]), (2, 0, vec![2, 1])]
    );
}

#[test]
fn failed_check_skips_the_root_connect() {
    const HOSTS: [&str; 4] = ["a", "a", "b", "b"];
    let coll_net = RecordingCollNet::new();
    let catalog = catalog(true);
    let recorder = Arc::clone(&coll_net);
    let results = run_ranks(4, move |rank, bootstrap| {
        let catalog = Arc::clone(&catalog);
        let coll_net = Arc::clone(&coll_net);
        async move {
            let mut comm = recording_comm(7, rank, &HOSTS, bootstrap, catalog, coll_net);
            // node "b" failed an earlier attempt
            let node_failed = comm.check_coll_net(comm.node == 1).await.unwrap();
            let recv_master = comm.local_rank_to_rank[0];
            let send_master = comm.local_rank_to_rank[comm.num_local_ranks() - 1];
            let setup = comm
                .connect_coll_net_channel(ChannelId(0), None, recv_master, send_master)
                .await;
            (comm.node, node_failed, setup)
        }
    });
    for (node, node_failed, setup) in results {
        assert_eq!(node_failed, node == 1);
        // node "a" misses the master of node "b"
        assert_eq!(setup, CollNetSetup::Fail);
    }
    assert!(recorder.setup_ranks().iter().all(|&rank| rank < 2));
    assert!(recorder.connect_ranks().iter().all(|&rank| rank < 2));
    assert!(recorder.recv_connects().is_empty());
}

#[test]
fn third_local_rank_frees_the_root() {
    const HOSTS: [&str; 3] = ["a", "a", "a"];
    let coll_net = RecordingCollNet::new();
    let catalog = catalog(true);
    let recorder = Arc::clone(&coll_net);
    let results = run_ranks(3, move |rank, bootstrap| {
        let catalog = Arc::clone(&catalog);
        let coll_net = Arc::clone(&coll_net);
        async move {
            let mut comm = recording_comm(8, rank, &HOSTS, bootstrap, catalog, Arc::clone(&coll_net));
            let setup = comm
                .connect_coll_net_channel(ChannelId(0), None, 0, 2)
                .await;
            assert_eq!(setup, CollNetSetup::Success);

            let mut teardowns = Vec::new();
            for step in 0..3 {
                if rank == step {
                    let released = comm.teardown_coll_net(ChannelId(0)).unwrap();
                    teardowns.push((released, coll_net.frees()));
                }
                comm.bootstrap
                    .barrier(&[0, 1, 2], rank, 0x7d00_0100 + step as u32)
                    .await
                    .unwrap();
            }
            assert!(!comm.teardown_coll_net(ChannelId(0)).unwrap());
            teardowns
        }
    });
    assert_eq!(
        results,
        vec![vec![(false, 0)], vec![(false, 0)], vec![(true, 2)]]
    );
    assert_eq!(recorder.setup_ranks().len(), 2);
    assert_eq!(recorder.frees(), 2);
}
