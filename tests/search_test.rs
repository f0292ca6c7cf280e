//! S2 — search: node A shares `hello.txt` (1 MiB); node B broadcasts a
//! search for "hello" and receives a `FindResult` naming it.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use common::NodeHandle;

#[tokio::test]
async fn search_finds_a_file_shared_by_another_node() {
    let a = NodeHandle::with_network("alice", 58201, 58210);
    std::fs::write(a.share_path().join("hello.txt"), vec![0xAB; 1_048_576]).unwrap();
    let a = a.start().await;

    let b = NodeHandle::with_network("bob", 58201, 58220).start().await;

    let b_network = b.network.as_ref().unwrap();
    let multicast_addr =
        SocketAddr::new(b.config.network.multicast_group, b.config.network.multicast_port);

    let mut results = b_network
        .search
        .search(
            &b_network.multicast_socket,
            multicast_addr,
            "hello".to_string(),
            b.config.network.max_udp_datagram_size,
            Duration::from_secs(b.config.network.search_lifetime_secs),
        )
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
        .await
        .expect("a FindResult arrived before the search's lifetime elapsed")
        .expect("the result channel stayed open");

    assert_eq!(result.peer_id, a.peer_id);
    assert!(result.entries.iter().any(|e| e.path == "hello.txt" && e.size == 1_048_576));

    a.stop();
    b.stop();
}
