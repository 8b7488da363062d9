mod common;

use std::sync::Arc;

use common::{peers, run_ranks};
use mccs_connect::comm::{Communicator, CommunicatorId};
use mccs_connect::config::ConnectConfig;
use mccs_connect::transport::catalog::TransportCatalog;
use mccs_connect::transport::channel::{ChannelId, ConnType};
use mccs_connect::transport::connector::ConnFlags;
use mccs_connect::transport::p2p::config::P2pTransportConfig;

// (transport name, descriptor flags) of the send connector to the next rank
fn connect_ring(hosts: &'static [&'static str], catalog: Arc<TransportCatalog>) -> Vec<(String, ConnFlags)> {
    let num_ranks = hosts.len();
    run_ranks(num_ranks, move |rank, bootstrap| {
        let catalog = Arc::clone(&catalog);
        async move {
            let mut comm = Communicator::new(
                CommunicatorId(6),
                rank,
                peers(hosts),
                1,
                bootstrap,
                catalog,
            )
            .unwrap()
            .with_connect_config(ConnectConfig {
                round_max_peers: 128,
                report_progress: false,
            });
            let prev = (rank + num_ranks - 1) % num_ranks;
            let next = (rank + 1) % num_ranks;
            comm.record_connect_intent(ChannelId(0), &[prev], &[next], 0)
                .unwrap();
            comm.establish_connections(None, 0, 128).await.unwrap();
            assert!(comm.is_connected(ChannelId(0), prev, ConnType::Recv, 0));
            let connector = comm.connector(ChannelId(0), next, ConnType::Send, 0).unwrap();
            let name = connector.transporter().unwrap().name().to_string();
            (name, connector.conn_info.flags)
        }
    })
}

#[test]
fn same_host_prefers_p2p() {
    let results = connect_ring(&["a", "a", "a"], Arc::new(TransportCatalog::new()));
    for (name, flags) in results {
        assert_eq!(name, "P2P");
        assert_eq!(flags, ConnFlags::DIRECT);
    }
}

#[test]
fn disabled_p2p_falls_back_to_shm() {
    let catalog = Arc::new(TransportCatalog::new());
    catalog.register_config(
        "P2pTransport".to_string(),
        P2pTransportConfig {
            enable: false,
            ..Default::default()
        },
    );
    let results = connect_ring(&["a", "a"], catalog);
    for (name, flags) in results {
        assert_eq!(name, "SHM");
        assert_eq!(flags, ConnFlags::SHARED);
    }
}

#[test]
fn different_hosts_connect_over_tcp() {
    let results = connect_ring(&["a", "b", "c"], Arc::new(TransportCatalog::new()));
    for (name, flags) in results {
        assert_eq!(name, "NET");
        assert_eq!(flags, ConnFlags::NET);
    }
}
