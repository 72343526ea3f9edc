// End-to-end scenario 2 (§8): on a 3-node cluster, a user event broadcast by
// one node reaches every node's event sink exactly once, with the same
// Lamport time.

use serf_core::config::Config;
use serf_core::event::{ChannelEventSink, Event};
use serf_core::Coordinator;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;

fn test_config(name: &str, addr: SocketAddr) -> Config {
    let mut cfg = Config::new(name, addr);
    cfg.gossip.gossip_interval = Duration::from_millis(30);
    cfg.gossip.gossip_to_the_dead_time = Duration::from_secs(0);
    cfg.reap_interval = Duration::from_secs(3600);
    cfg
}

async fn expect_user_event(rx: &mut Receiver<Event>, expected_name: &str, timeout: Duration) -> (String, u64) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            panic!("timed out waiting for user event {:?}", expected_name);
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(Event::User(u))) if u.name == expected_name => {
                return (String::from_utf8(u.payload).unwrap(), u.ltime);
            }
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event channel closed before delivering {:?}", expected_name),
            Err(_) => panic!("timed out waiting for user event {:?}", expected_name),
        }
    }
}

#[tokio::test]
async fn user_event_reaches_every_node_exactly_once() {
    let addr_a: SocketAddr = "127.0.0.1:17950".parse().unwrap();
    let addr_b: SocketAddr = "127.0.0.1:17951".parse().unwrap();
    let addr_c: SocketAddr = "127.0.0.1:17952".parse().unwrap();

    let (sink_a, mut rx_a) = ChannelEventSink::new(64);
    let (sink_b, mut rx_b) = ChannelEventSink::new(64);
    let (sink_c, mut rx_c) = ChannelEventSink::new(64);

    let node_a = Coordinator::create(test_config("A", addr_a), Some(Arc::new(sink_a))).await.unwrap();
    let node_b = Coordinator::create(test_config("B", addr_b), Some(Arc::new(sink_b))).await.unwrap();
    let node_c = Coordinator::create(test_config("C", addr_c), Some(Arc::new(sink_c))).await.unwrap();

    assert_eq!(node_b.join(&[addr_a]).await.unwrap(), 1);
    assert_eq!(node_c.join(&[addr_a]).await.unwrap(), 1);

    let ltime = node_a
        .user_event("deploy".to_string(), b"v1".to_vec(), false)
        .await
        .unwrap();

    let timeout = Duration::from_secs(2);
    let (payload_a, ltime_a) = expect_user_event(&mut rx_a, "deploy", timeout).await;
    let (payload_b, ltime_b) = expect_user_event(&mut rx_b, "deploy", timeout).await;
    let (payload_c, ltime_c) = expect_user_event(&mut rx_c, "deploy", timeout).await;

    assert_eq!(payload_a, "v1");
    assert_eq!(payload_b, "v1");
    assert_eq!(payload_c, "v1");
    assert_eq!(ltime_a, ltime);
    assert_eq!(ltime_b, ltime);
    assert_eq!(ltime_c, ltime);

    node_a.shutdown().await;
    node_b.shutdown().await;
    node_c.shutdown().await;
}
