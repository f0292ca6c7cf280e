//! `FILE_CACHE`: a per-shared-root on-disk record of chunk digests, so a
//! restarted node doesn't re-hash every file it already indexed.
//!
//! One [`redb`] database per root, keyed by the file's path relative to the
//! root. The database itself is named from the root's filesystem path rather
//! than its [`RootId`] — the id is minted fresh by [`Mirror::add_root`] every
//! process start, so a cache keyed on it would never survive a restart. On
//! the scan that follows `add_root`, any entry whose size and modification
//! time still match the cached record reclaims its digests instead of
//! waiting on the hasher.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::chunk::mirror::Mirror;
use crate::chunk::store::{ChunkIndex, ChunkLocation};
use crate::error::MirrorError;
use crate::logging::warn;
use crate::types::{Digest, EntryKind, RootId};

const FILES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedFile {
    size: u64,
    modified_unix: u64,
    digests: Vec<Digest>,
}

/// Per-root chunk-digest cache backed by one `redb` database file.
pub struct FileCache {
    db: redb::Database,
}

impl FileCache {
    /// Open (creating if absent) the cache database for the shared root at
    /// `root_path`, under `state_dir`. A corrupted database file is renamed
    /// aside with a `.backup` suffix and replaced with an empty one — the
    /// "fatal" error policy for a corrupted `FILE_CACHE`: log, quarantine,
    /// start fresh, never fail startup.
    pub fn open(state_dir: &Path, root_path: &Path) -> Result<Self, MirrorError> {
        std::fs::create_dir_all(state_dir).map_err(MirrorError::Io)?;
        let path = cache_path(state_dir, root_path);
        match redb::Database::create(&path) {
            Ok(db) => {
                ensure_table(&db)?;
                Ok(Self { db })
            }
            Err(e) => {
                warn!("chunk cache {} is corrupted ({}), starting fresh", path.display(), e);
                let backup = path.with_extension("redb.backup");
                let _ = std::fs::rename(&path, &backup);
                let db = redb::Database::create(&path).map_err(to_mirror_error)?;
                ensure_table(&db)?;
                Ok(Self { db })
            }
        }
    }

    /// Persist digests for every fully-hashed file currently mirrored under
    /// `root`.
    pub fn save(&self, mirror: &Mirror, root: RootId) -> Result<(), MirrorError> {
        let write_txn = self.db.begin_write().map_err(to_mirror_error)?;
        {
            let mut table = write_txn.open_table(FILES_TABLE).map_err(to_mirror_error)?;
            let Some(root_entry) = mirror.root_entry(root) else { return Ok(()) };
            for (rel_path, entry) in walk_files(mirror, root_entry, PathBuf::new()) {
                if !entry.has_all_hashes() {
                    continue;
                }
                let EntryKind::File { chunks, .. } = &entry.kind else { continue };
                let cached = CachedFile {
                    size: entry.size,
                    modified_unix: unix_secs(entry.modified),
                    digests: chunks.iter().filter_map(|c| c.digest).collect(),
                };
                let bytes = bincode::serialize(&cached).map_err(to_mirror_error)?;
                let key = rel_path.to_string_lossy();
                table.insert(key.as_ref(), bytes.as_slice()).map_err(to_mirror_error)?;
            }
        }
        write_txn.commit().map_err(to_mirror_error)?;
        Ok(())
    }

    /// Reclaim digests for every unhashed file under `root` whose cached
    /// size and modification time still match. Returns the number of files
    /// reclaimed.
    pub fn reclaim(
        &self,
        mirror: &Mirror,
        chunk_index: &ChunkIndex,
        root: RootId,
    ) -> Result<usize, MirrorError> {
        let read_txn = self.db.begin_read().map_err(to_mirror_error)?;
        let table = read_txn.open_table(FILES_TABLE).map_err(to_mirror_error)?;

        let Some(root_entry) = mirror.root_entry(root) else { return Ok(0) };
        let mut reclaimed = 0;
        for (rel_path, entry) in walk_files(mirror, root_entry, PathBuf::new()) {
            if entry.has_all_hashes() {
                continue;
            }
            let key = rel_path.to_string_lossy();
            let Some(stored) = table.get(key.as_ref()).map_err(to_mirror_error)? else { continue };
            let bytes = stored.value().to_vec();
            let Ok(cached) = bincode::deserialize::<CachedFile>(&bytes) else { continue };
            if cached.size != entry.size || cached.modified_unix != unix_secs(entry.modified) {
                continue;
            }
            for (num, digest) in cached.digests.into_iter().enumerate() {
                mirror.set_chunk_digest(entry.id, num as u32, digest);
                chunk_index.add(digest, ChunkLocation { entry: entry.id, chunk_num: num as u32 });
            }
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}

fn ensure_table(db: &redb::Database) -> Result<(), MirrorError> {
    let write_txn = db.begin_write().map_err(to_mirror_error)?;
    {
        let _ = write_txn.open_table(FILES_TABLE).map_err(to_mirror_error)?;
    }
    write_txn.commit().map_err(to_mirror_error)
}

fn cache_path(state_dir: &Path, root_path: &Path) -> PathBuf {
    let digest = Digest::of(root_path.to_string_lossy().as_bytes());
    state_dir.join(format!("FILE_CACHE_{}.redb", &digest.to_hex()[..16]))
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Depth-first walk of every file entry under `dir`, yielding each one's
/// path relative to the root alongside a clone of the entry.
fn walk_files(
    mirror: &Mirror,
    dir: crate::types::EntryId,
    prefix: PathBuf,
) -> Vec<(PathBuf, crate::types::Entry)> {
    let mut out = Vec::new();
    for child in mirror.children(dir) {
        let Some(entry) = mirror.get_entry_clone(child) else { continue };
        let rel = prefix.join(&entry.name);
        match &entry.kind {
            EntryKind::Directory { .. } => out.extend(walk_files(mirror, child, rel)),
            EntryKind::File { .. } => out.push((rel, entry)),
        }
    }
    out
}

fn to_mirror_error<E: std::fmt::Display>(e: E) -> MirrorError {
    MirrorError::Io(std::io::Error::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RootAccess;
    use std::sync::Arc;

    async fn scan(mirror: &Arc<Mirror>, root: RootId, root_path: &Path) {
        let coordinator = crate::chunk::scan::ScanCoordinator::new();
        crate::chunk::scan::scan_root(coordinator, mirror.clone(), root, root_path.to_path_buf()).await;
    }

    #[tokio::test]
    async fn save_then_reclaim_restores_digest_across_a_simulated_restart() {
        let root_dir = tempfile::tempdir().unwrap();
        std::fs::write(root_dir.path().join("a.txt"), b"hello world").unwrap();

        let mirror = Arc::new(Mirror::new());
        let root = mirror.add_root(root_dir.path().to_path_buf(), RootAccess::ReadWrite);
        scan(&mirror, root, root_dir.path()).await;
        let file_entry = mirror.find_child(mirror.root_entry(root).unwrap(), "a.txt").unwrap();
        mirror.set_chunk_digest(file_entry, 0, Digest::of(b"hello world"));

        let state_dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(state_dir.path(), root_dir.path()).unwrap();
        cache.save(&mirror, root).unwrap();

        // A fresh process: new Mirror (so a new, different RootId), fresh
        // scan of the same directory, digests not yet known.
        let mirror2 = Arc::new(Mirror::new());
        let root2 = mirror2.add_root(root_dir.path().to_path_buf(), RootAccess::ReadWrite);
        scan(&mirror2, root2, root_dir.path()).await;
        let file_entry2 = mirror2.find_child(mirror2.root_entry(root2).unwrap(), "a.txt").unwrap();
        assert!(!mirror2.get_entry_clone(file_entry2).unwrap().has_all_hashes());

        // Reopening the cache by path (not by the now-different RootId)
        // finds the same database and reclaims the digest.
        let cache2 = FileCache::open(state_dir.path(), root_dir.path()).unwrap();
        let chunk_index = ChunkIndex::new();
        let reclaimed = cache2.reclaim(&mirror2, &chunk_index, root2).unwrap();
        assert_eq!(reclaimed, 1);
        assert!(mirror2.get_entry_clone(file_entry2).unwrap().has_all_hashes());
        assert!(chunk_index.contains(&Digest::of(b"hello world")));
    }

    #[tokio::test]
    async fn reclaim_skips_files_whose_size_no_longer_matches() {
        let root_dir = tempfile::tempdir().unwrap();
        std::fs::write(root_dir.path().join("a.txt"), b"hello world").unwrap();

        let mirror = Arc::new(Mirror::new());
        let root = mirror.add_root(root_dir.path().to_path_buf(), RootAccess::ReadWrite);
        scan(&mirror, root, root_dir.path()).await;
        let file_entry = mirror.find_child(mirror.root_entry(root).unwrap(), "a.txt").unwrap();
        mirror.set_chunk_digest(file_entry, 0, Digest::of(b"hello world"));

        let state_dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(state_dir.path(), root_dir.path()).unwrap();
        cache.save(&mirror, root).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(1100));
        std::fs::write(root_dir.path().join("a.txt"), b"hello world, now longer").unwrap();

        let mirror2 = Arc::new(Mirror::new());
        let root2 = mirror2.add_root(root_dir.path().to_path_buf(), RootAccess::ReadWrite);
        scan(&mirror2, root2, root_dir.path()).await;

        let cache2 = FileCache::open(state_dir.path(), root_dir.path()).unwrap();
        let chunk_index = ChunkIndex::new();
        let reclaimed = cache2.reclaim(&mirror2, &chunk_index, root2).unwrap();
        assert_eq!(reclaimed, 0);
    }

    #[test]
    fn corrupted_database_file_is_quarantined_and_replaced() {
        let state_dir = tempfile::tempdir().unwrap();
        let root_dir = tempfile::tempdir().unwrap();
        let path = cache_path(state_dir.path(), root_dir.path());
        std::fs::write(&path, b"not a redb database").unwrap();

        let cache = FileCache::open(state_dir.path(), root_dir.path());
        assert!(cache.is_ok());
        assert!(path.with_extension("redb.backup").exists());
    }
}
