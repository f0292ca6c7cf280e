//! S5 — peer death: after mutual discovery, A goes dark without a goodbye.
//! B must notice within `peer_timeout_factor * peer_imalive_period` that A's
//! beacon has stopped and mark it no longer alive.

mod common;

use std::time::Duration;

use common::{wait_until, NodeHandle};

#[tokio::test]
async fn a_dead_peer_is_forgotten_after_its_timeout() {
    let a = NodeHandle::with_network("alice", 58301, 58310).start().await;
    let b = NodeHandle::with_network("bob", 58301, 58320).start().await;

    let period = Duration::from_secs(b.config.peer.peer_imalive_period_secs);
    let discovery_deadline = period * 2 + Duration::from_secs(2);
    let discovered = wait_until(discovery_deadline, || b.directory.is_alive(a.peer_id)).await;
    assert!(discovered, "bob never saw alice's beacon before killing her");

    a.kill();

    let timeout = period * b.config.peer.peer_timeout_factor as u32 + Duration::from_secs(2);
    let forgotten = wait_until(timeout, || {
        b.directory.prune_expired();
        !b.directory.is_alive(a.peer_id)
    })
    .await;
    assert!(forgotten, "bob still thinks alice is alive after her timeout elapsed");

    b.stop();
}
