// End-to-end scenario 1 (§8): two nodes, one joins the other directly by
// address; within a handful of gossip intervals both report each other as
// `Alive` and no member event is dropped.

use serf_core::config::Config;
use serf_core::event::ChannelEventSink;
use serf_core::member::Status;
use serf_core::Coordinator;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn test_config(name: &str, addr: SocketAddr) -> Config {
    let mut cfg = Config::new(name, addr);
    // Tight intervals so the test doesn't wait on the default production
    // timers; the join path itself is a direct push/pull and doesn't strictly
    // need this, but the background loops (reaper, gossip) should still tick
    // fast enough that this configuration would also work for slower paths.
    cfg.gossip.probe_interval = Duration::from_millis(100);
    cfg.gossip.gossip_interval = Duration::from_millis(50);
    cfg.gossip.gossip_to_the_dead_time = Duration::from_secs(0);
    cfg.reap_interval = Duration::from_secs(3600);
    cfg
}

#[tokio::test]
async fn two_node_join_converges_to_mutual_alive() {
    let addr_a: SocketAddr = "127.0.0.1:17946".parse().unwrap();
    let addr_b: SocketAddr = "127.0.0.1:17947".parse().unwrap();

    let (sink_a, _rx_a) = ChannelEventSink::new(64);
    let (sink_b, _rx_b) = ChannelEventSink::new(64);

    let node_a = Coordinator::create(test_config("A", addr_a), Some(Arc::new(sink_a)))
        .await
        .expect("node A starts");
    let node_b = Coordinator::create(test_config("B", addr_b), Some(Arc::new(sink_b)))
        .await
        .expect("node B starts");

    let joined = node_b.join(&[addr_a]).await.expect("join does not error");
    assert_eq!(joined, 1, "B must successfully push/pull with A");

    let members_a = node_a.members().await;
    let members_b = node_b.members().await;

    assert_eq!(members_a.len(), 2, "A must know about itself and B");
    assert_eq!(members_b.len(), 2, "B must know about itself and A");

    let a_knows_b = members_a.iter().find(|m| m.node.name == "B").expect("A knows B");
    assert_eq!(a_knows_b.status, Status::Alive);

    let b_knows_a = members_b.iter().find(|m| m.node.name == "A").expect("B knows A");
    assert_eq!(b_knows_a.status, Status::Alive);

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn join_against_nonexistent_peers_reports_partial_success() {
    let addr_c: SocketAddr = "127.0.0.1:17948".parse().unwrap();
    let addr_d: SocketAddr = "127.0.0.1:17949".parse().unwrap();

    let node_c = Coordinator::create(test_config("C", addr_c), None).await.expect("node C starts");

    let nobody_listening: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let joined = node_c.join(&[nobody_listening, addr_d]).await.expect("join does not error");
    assert_eq!(joined, 0, "neither address answers");

    node_c.shutdown().await;
}
