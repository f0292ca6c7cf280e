//! S1 — presence: two nodes on the same multicast group discover each other
//! via periodic `IM_ALIVE` beacons within `2 * peer_imalive_period`.

mod common;

use std::time::Duration;

use common::{wait_until, NodeHandle};

#[tokio::test]
async fn nodes_discover_each_other_via_presence_beacons() {
    let a = NodeHandle::with_network("alice", 58101, 58110).start().await;
    let b = NodeHandle::with_network("bob", 58101, 58120).start().await;

    let period = Duration::from_secs(a.config.peer.peer_imalive_period_secs);
    let deadline = period * 2 + Duration::from_secs(2);

    let b_sees_a = wait_until(deadline, || b.directory.is_alive(a.peer_id)).await;
    let a_sees_b = wait_until(deadline, || a.directory.is_alive(b.peer_id)).await;

    assert!(b_sees_a, "bob never saw alice's beacon");
    assert!(a_sees_b, "alice never saw bob's beacon");

    assert_eq!(b.directory.get(a.peer_id).unwrap().nickname, "alice");
    assert_eq!(a.directory.get(b.peer_id).unwrap().nickname, "bob");

    a.stop();
    b.stop();
}
