//! S3: the leader elected from a fresh three-node cluster replicates 100
//! commands to every follower, identically and in order.

mod fixtures;

use std::time::Duration;

use fixtures::fast_test_config;
use fixtures::new_node;
use fixtures::set_command;
use fixtures::Router;
use raft_core::Role;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_replicates_one_hundred_commands() {
    fixtures::init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let router = Router::new();
    let names = ["n1", "n2", "n3"];

    let mut handles = vec![];
    let mut stores = vec![];
    for name in names {
        let config = fast_test_config("replication");
        let (server, handle, store) = new_node(&router, name, dir.path().join(name), config).await;
        for other in names {
            if other != name {
                handle.add_peer(other.to_string()).await.unwrap();
            }
        }
        server.start_follower();
        handles.push(handle);
        stores.push(store);
    }

    tokio::time::sleep(Duration::from_millis(900)).await;

    let leader = handles
        .iter()
        .find(|h| h.metrics().borrow().role == Role::Leader)
        .expect("a leader must have been elected")
        .clone();

    for i in 0..100u32 {
        let (name, payload) = set_command(&format!("k{}", i), &format!("v{}", i));
        leader.do_command(name, payload).await.expect("command must commit");
    }

    // Give followers time to catch up on the next few heartbeats.
    tokio::time::sleep(Duration::from_millis(300)).await;

    for handle in &handles {
        let metrics = handle.metrics().borrow().clone();
        assert_eq!(metrics.last_log_index, 100, "{} should have all 100 entries", metrics.name);
        assert_eq!(metrics.last_applied, 100, "{} should have applied all 100 entries", metrics.name);
    }

    for store in &stores {
        assert_eq!(store.len(), 100);
        assert_eq!(store.get("k0").as_deref(), Some("v0"));
        assert_eq!(store.get("k99").as_deref(), Some("v99"));
    }

    for handle in &handles {
        handle.stop().await;
    }
}
