//! S4 — multi-chunk download: a 5 MiB file (three 2 MiB chunks, the last
//! short) downloads from A to B. All three chunks materialize with correct
//! digests and the assembled file is byte-identical to A's.

mod common;

use std::time::Duration;

use common::{wait_until, NodeHandle};
use dlan::config::CHUNK_SIZE;
use dlan::peer::directory::PeerInfo;
use dlan::types::{chunk_layout, SharedEntryWire};

#[tokio::test]
async fn multi_chunk_file_downloads_in_full() {
    let a = NodeHandle::new("alice");
    let size = CHUNK_SIZE * 2 + 512 * 1024;
    let mut contents = vec![0u8; size as usize];
    for (i, byte) in contents.iter_mut().enumerate() {
        *byte = (i % 256) as u8;
    }
    std::fs::write(a.share_path().join("movie.bin"), &contents).unwrap();
    let a = a.start().await;
    a.wait_hashed("movie.bin").await;

    let b = NodeHandle::new("bob").start().await;

    b.directory.update_peer(PeerInfo {
        id: a.peer_id,
        nickname: "alice".to_string(),
        addr: a.addr,
        shared_bytes: size,
        download_rate: 0.0,
        upload_rate: 0.0,
        protocol_version: 1,
    });

    let remote = SharedEntryWire {
        path: "movie.bin".to_string(),
        is_dir: false,
        size,
        modified_unix: 0,
        chunk_digests: Vec::new(),
    };
    let download_id = b.downloads.new_download(remote, a.peer_id);

    let done = wait_until(Duration::from_secs(15), || {
        b.downloads
            .queue
            .get(download_id)
            .map(|d| d.status == dlan::download::DownloadStatus::Complete)
            .unwrap_or(false)
    })
    .await;
    assert!(done, "multi-chunk download did not complete in time");

    let download = b.downloads.queue.get(download_id).unwrap();
    assert_eq!(download.chunk_count(), chunk_layout(size).len());
    assert_eq!(download.chunk_count(), 3);

    let final_path = b.root_path().join(&download.path);
    let received = std::fs::read(&final_path).unwrap();
    assert_eq!(received, contents);

    for (num, digest) in download.chunk_digests.iter().enumerate() {
        let digest = digest.unwrap_or_else(|| panic!("chunk {num} missing a digest"));
        let (_, len) = chunk_layout(size)[num];
        let offset = num as u64 * CHUNK_SIZE;
        let expected =
            dlan::types::Digest::of(&contents[offset as usize..offset as usize + len as usize]);
        assert_eq!(digest, expected, "chunk {num} digest mismatch");
    }

    a.stop();
    b.stop();
}
