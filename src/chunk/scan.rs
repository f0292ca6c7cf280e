//! BFS directory scan, diffed against the mirror.
//!
//! A scan walks a shared root breadth-first, reconciling what it finds on
//! disk against the corresponding subtree of the [`Mirror`]: new files are
//! added with no digests, entries missing from disk are removed, and
//! size/mtime-mismatched files are invalidated (their chunk digests
//! cleared so the hasher recomputes them). At most one scan per root runs
//! at a time; a later call observes the in-flight one and waits for it to
//! finish rather than racing it.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::Mutex as AsyncMutex;

use crate::chunk::mirror::Mirror;
use crate::logging::debug;
use crate::types::{EntryId, RootId};

const UNFINISHED_SUFFIX: &str = ".unfinished";

/// Tracks the single in-flight scan per root and lets `stop_scanning` block
/// until it yields.
pub struct ScanCoordinator {
    running: AsyncMutex<HashSet<RootId>>,
    cancel: AtomicBool,
}

impl ScanCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { running: AsyncMutex::new(HashSet::new()), cancel: AtomicBool::new(false) })
    }

    pub fn request_stop(&self, _root: RootId) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn should_cancel(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn clear_cancel(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }
}

/// Result of one scan pass, used so callers (the hasher, in particular) know
/// which new files need to be queued for hashing.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub new_files: Vec<EntryId>,
    pub removed: usize,
    pub invalidated: Vec<EntryId>,
}

/// Scan a shared root, updating `mirror` in place. Returns once the BFS
/// walk and diff complete or the coordinator is asked to cancel (in which
/// case the scan yields at the next directory boundary, leaving the mirror
/// partially updated but internally consistent).
pub async fn scan_root(
    coordinator: Arc<ScanCoordinator>,
    mirror: Arc<Mirror>,
    root: RootId,
    root_path: PathBuf,
) -> ScanReport {
    {
        let mut running = coordinator.running.lock().await;
        if !running.insert(root) {
            debug!("scan already running for root {:?}", root);
            return ScanReport::default();
        }
    }
    coordinator.clear_cancel();

    let report = tokio::task::spawn_blocking(move || scan_blocking(&mirror, &coordinator, root, &root_path))
        .await
        .unwrap_or_default();

    report
}

fn scan_blocking(
    mirror: &Mirror,
    coordinator: &ScanCoordinator,
    root: RootId,
    root_path: &std::path::Path,
) -> ScanReport {
    let mut report = ScanReport::default();
    let Some(root_entry) = mirror.root_entry(root) else { return report };

    let mut queue: VecDeque<(EntryId, PathBuf)> = VecDeque::new();
    queue.push_back((root_entry, root_path.to_path_buf()));

    while let Some((dir_entry, dir_path)) = queue.pop_front() {
        if coordinator.should_cancel() {
            break;
        }

        let disk_names: HashSet<String> = match std::fs::read_dir(&dir_path) {
            Ok(iter) => iter
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| !name.ends_with(UNFINISHED_SUFFIX))
                .collect(),
            Err(_) => HashSet::new(),
        };

        // Remove mirror children no longer present on disk.
        let mirror_children = mirror.children(dir_entry);
        for child in &mirror_children {
            if let Some(entry) = mirror.get_entry_clone(*child) {
                if !disk_names.contains(&entry.name) {
                    mirror.remove(*child);
                    report.removed += 1;
                }
            }
        }

        for name in &disk_names {
            let child_path = dir_path.join(name);
            let metadata = match std::fs::symlink_metadata(&child_path) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

            if metadata.is_dir() {
                let child_entry = match mirror.find_child(dir_entry, name) {
                    Some(existing) => existing,
                    None => mirror.insert_directory(dir_entry, name.clone(), root, modified),
                };
                queue.push_back((child_entry, child_path));
            } else if metadata.is_file() {
                let size = metadata.len();
                match mirror.find_child(dir_entry, name) {
                    Some(existing) => {
                        if let Some(entry) = mirror.get_entry_clone(existing) {
                            let mismatch = entry.size != size || entry.modified != modified;
                            if mismatch {
                                mirror.invalidate(existing, size, modified);
                                report.invalidated.push(existing);
                            }
                        }
                    }
                    None => {
                        let id = mirror.insert_file(dir_entry, name.clone(), root, size, modified);
                        report.new_files.push(id);
                    }
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RootAccess;

    #[tokio::test]
    async fn scan_discovers_new_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();

        let mirror = Arc::new(Mirror::new());
        let root = mirror.add_root(dir.path().to_path_buf(), RootAccess::ReadWrite);
        let coordinator = ScanCoordinator::new();

        let report = scan_root(coordinator, mirror.clone(), root, dir.path().to_path_buf()).await;
        assert_eq!(report.new_files.len(), 2);
    }

    #[tokio::test]
    async fn rescan_removes_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"hello").unwrap();

        let mirror = Arc::new(Mirror::new());
        let root = mirror.add_root(dir.path().to_path_buf(), RootAccess::ReadWrite);
        let coordinator = ScanCoordinator::new();
        scan_root(coordinator.clone(), mirror.clone(), root, dir.path().to_path_buf()).await;

        std::fs::remove_file(&file_path).unwrap();
        let report = scan_root(coordinator, mirror.clone(), root, dir.path().to_path_buf()).await;
        assert_eq!(report.removed, 1);
    }

    #[tokio::test]
    async fn rescan_invalidates_changed_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"hello").unwrap();

        let mirror = Arc::new(Mirror::new());
        let root = mirror.add_root(dir.path().to_path_buf(), RootAccess::ReadWrite);
        let coordinator = ScanCoordinator::new();
        scan_root(coordinator.clone(), mirror.clone(), root, dir.path().to_path_buf()).await;

        // Ensure a distinguishable mtime on filesystems with coarse
        // resolution.
        std::thread::sleep(std::time::Duration::from_millis(1100));
        std::fs::write(&file_path, b"hello, world, now longer").unwrap();

        let report = scan_root(coordinator, mirror.clone(), root, dir.path().to_path_buf()).await;
        assert_eq!(report.invalidated.len(), 1);
    }
}
