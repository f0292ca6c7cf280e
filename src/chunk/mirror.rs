//! In-memory tree shadowing a shared root's filesystem contents.
//!
//! Each shared root gets one tree of [`Entry`] nodes reachable from a
//! synthetic root entry. Scan (`chunk::scan`), the watcher, and protocol
//! handlers all read and write through this single structure, one mutex
//! guarding the whole tree — "no nested acquisitions", as the concurrency
//! model requires.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::error::MirrorError;
use crate::types::{
    chunk_layout, Chunk, Entry, EntryId, EntryKind, RootAccess, RootId, SharedEntryWire,
    SharedRoot,
};

const UNFINISHED_SUFFIX: &str = ".unfinished";

struct Tree {
    /// `None` for a root's own synthetic top-level directory entry, which
    /// has no parent.
    entries: HashMap<EntryId, Entry>,
    root_dirs: HashMap<RootId, EntryId>,
}

/// Owns every shared root's mirror tree plus the id allocator.
pub struct Mirror {
    roots: Mutex<Vec<SharedRoot>>,
    tree: Mutex<Tree>,
    next_id: AtomicU64,
}

impl Mirror {
    pub fn new() -> Self {
        Self {
            roots: Mutex::new(Vec::new()),
            tree: Mutex::new(Tree { entries: HashMap::new(), root_dirs: HashMap::new() }),
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc_id(&self) -> EntryId {
        EntryId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Add a shared root, merging with an existing one if either is a
    /// prefix of the other — per the resolved open question on nested
    /// roots: "merge into existing root, dropping the inner root ID".
    pub fn add_root(&self, path: PathBuf, access: RootAccess) -> RootId {
        let mut roots = self.roots.lock().unwrap();
        for existing in roots.iter() {
            if path.starts_with(&existing.path) {
                return existing.id;
            }
        }
        if let Some(pos) = roots.iter().position(|r| r.path.starts_with(&path)) {
            // The new root is a proper ancestor of an existing one: widen
            // the existing root in place rather than keeping two.
            let inner_id = roots[pos].id;
            roots[pos] = SharedRoot { id: inner_id, path: path.clone(), access };
            return inner_id;
        }

        let id = RootId::generate();
        let entry_id = self.alloc_id();
        let mut tree = self.tree.lock().unwrap();
        tree.entries.insert(
            entry_id,
            Entry {
                id: entry_id,
                parent: None,
                root: id,
                name: String::new(),
                size: 0,
                modified: SystemTime::now(),
                kind: EntryKind::Directory { children: Vec::new() },
                scanned: false,
            },
        );
        tree.root_dirs.insert(id, entry_id);
        drop(tree);
        roots.push(SharedRoot { id, path, access });
        id
    }

    pub fn roots(&self) -> Vec<SharedRoot> {
        self.roots.lock().unwrap().clone()
    }

    fn root_path(&self, root: RootId) -> Option<PathBuf> {
        self.roots.lock().unwrap().iter().find(|r| r.id == root).map(|r| r.path.clone())
    }

    fn root_dir_entry(&self, root: RootId) -> Option<EntryId> {
        self.tree.lock().unwrap().root_dirs.get(&root).copied()
    }

    /// Absolute filesystem path of an entry, reconstructed by walking
    /// parents up to the root directory.
    pub fn resolve_path(&self, id: EntryId) -> Option<PathBuf> {
        let (root, segments) = {
            let tree = self.tree.lock().unwrap();
            let mut segments = Vec::new();
            let mut current = id;
            loop {
                let entry = tree.entries.get(&current)?;
                if entry.parent.is_none() {
                    break (entry.root, segments);
                }
                segments.push(entry.name.clone());
                current = entry.parent.unwrap();
            }
        };
        self.finish_path(root, segments)
    }

    fn finish_path(&self, root: RootId, mut segments: Vec<String>) -> Option<PathBuf> {
        segments.reverse();
        let mut path = self.root_path(root)?;
        for s in segments {
            path.push(s);
        }
        Some(path)
    }

    pub fn get_entry_clone(&self, id: EntryId) -> Option<Entry> {
        self.tree.lock().unwrap().entries.get(&id).cloned()
    }

    /// Find a child entry by name under `parent`, used by scan's diffing.
    pub fn find_child(&self, parent: EntryId, name: &str) -> Option<EntryId> {
        let tree = self.tree.lock().unwrap();
        let entry = tree.entries.get(&parent)?;
        if let EntryKind::Directory { children } = &entry.kind {
            for &child in children {
                if tree.entries.get(&child).map(|e| e.name.as_str()) == Some(name) {
                    return Some(child);
                }
            }
        }
        None
    }

    pub fn root_entry(&self, root: RootId) -> Option<EntryId> {
        self.root_dir_entry(root)
    }

    /// Insert a freshly scanned file, with no digests yet (scan only learns
    /// size/mtime; the hasher fills digests in asynchronously).
    pub fn insert_file(
        &self,
        parent: EntryId,
        name: String,
        root: RootId,
        size: u64,
        modified: SystemTime,
    ) -> EntryId {
        let id = self.alloc_id();
        let chunks = chunk_layout(size).into_iter().map(|(n, s)| Chunk::new(n, s)).collect();
        let mut tree = self.tree.lock().unwrap();
        tree.entries.insert(
            id,
            Entry {
                id,
                parent: Some(parent),
                root,
                name,
                size,
                modified,
                kind: EntryKind::File { chunks, unfinished: false },
                scanned: true,
            },
        );
        if let Some(parent_entry) = tree.entries.get_mut(&parent) {
            if let EntryKind::Directory { children } = &mut parent_entry.kind {
                children.push(id);
            }
        }
        id
    }

    pub fn insert_directory(
        &self,
        parent: EntryId,
        name: String,
        root: RootId,
        modified: SystemTime,
    ) -> EntryId {
        let id = self.alloc_id();
        let mut tree = self.tree.lock().unwrap();
        tree.entries.insert(
            id,
            Entry {
                id,
                parent: Some(parent),
                root,
                name,
                size: 0,
                modified,
                kind: EntryKind::Directory { children: Vec::new() },
                scanned: true,
            },
        );
        if let Some(parent_entry) = tree.entries.get_mut(&parent) {
            if let EntryKind::Directory { children } = &mut parent_entry.kind {
                children.push(id);
            }
        }
        id
    }

    /// Remove an entry (and, recursively, a directory's children) from the
    /// tree — used when scan or the watcher observes a deletion.
    pub fn remove(&self, id: EntryId) {
        let mut tree = self.tree.lock().unwrap();
        let Some(entry) = tree.entries.remove(&id) else { return };
        if let Some(parent) = entry.parent {
            if let Some(parent_entry) = tree.entries.get_mut(&parent) {
                if let EntryKind::Directory { children } = &mut parent_entry.kind {
                    children.retain(|&c| c != id);
                }
            }
        }
        if let EntryKind::Directory { children } = entry.kind {
            drop(tree);
            for child in children {
                self.remove(child);
            }
        }
    }

    /// Invalidate a file's digests (size/mtime mismatch found by scan):
    /// chunks are reset to the new layout with no known bytes.
    pub fn invalidate(&self, id: EntryId, new_size: u64, new_modified: SystemTime) {
        let mut tree = self.tree.lock().unwrap();
        if let Some(entry) = tree.entries.get_mut(&id) {
            entry.size = new_size;
            entry.modified = new_modified;
            entry.kind = EntryKind::File {
                chunks: chunk_layout(new_size).into_iter().map(|(n, s)| Chunk::new(n, s)).collect(),
                unfinished: false,
            };
        }
    }

    /// Record a chunk's digest once the hasher (or an integrity-verified
    /// download write) has computed it.
    pub fn set_chunk_digest(&self, id: EntryId, chunk_num: u32, digest: crate::types::Digest) {
        let mut tree = self.tree.lock().unwrap();
        if let Some(entry) = tree.entries.get_mut(&id) {
            if let EntryKind::File { chunks, .. } = &mut entry.kind {
                if let Some(chunk) = chunks.iter_mut().find(|c| c.num == chunk_num) {
                    chunk.digest = Some(digest);
                    chunk.known_bytes = chunk.size;
                }
            }
        }
    }

    pub fn set_chunk_known_bytes(&self, id: EntryId, chunk_num: u32, known_bytes: u32) {
        let mut tree = self.tree.lock().unwrap();
        if let Some(entry) = tree.entries.get_mut(&id) {
            if let EntryKind::File { chunks, .. } = &mut entry.kind {
                if let Some(chunk) = chunks.iter_mut().find(|c| c.num == chunk_num) {
                    chunk.known_bytes = known_bytes;
                    if known_bytes < chunk.size {
                        chunk.digest = None;
                    }
                }
            }
        }
    }

    pub fn chunks_needing_hash(&self, id: EntryId) -> Vec<u32> {
        let tree = self.tree.lock().unwrap();
        match tree.entries.get(&id).map(|e| &e.kind) {
            Some(EntryKind::File { chunks, .. }) => chunks
                .iter()
                .filter(|c| c.is_complete() && c.digest.is_none())
                .map(|c| c.num)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Materialize a new download target from a remote `GET_ENTRIES` reply:
    /// allocate a `.unfinished` file at final size in a writable root with
    /// enough free space, whose path is the longest-common-prefix match for
    /// the remote path.
    pub fn new_file(&self, remote: &SharedEntryWire) -> Result<EntryId, MirrorError> {
        let remote_path = Path::new(&remote.path);
        let writable: Vec<SharedRoot> = {
            let roots = self.roots.lock().unwrap();
            roots.iter().filter(|r| r.access == RootAccess::ReadWrite).cloned().collect()
        };
        if writable.is_empty() {
            return Err(MirrorError::NoWritableRoot);
        }

        // Among writable roots with enough free space, prefer the one with
        // the most room.
        let mut root: Option<(SharedRoot, u64)> = None;
        for candidate in writable {
            let available = available_space(&candidate.path)?;
            if available >= remote.size
                && root.as_ref().map(|(_, best)| available > *best).unwrap_or(true)
            {
                root = Some((candidate, available));
            }
        }
        let (root, _available) = root.ok_or(MirrorError::InsufficientSpace {
            needed: remote.size,
            available: 0,
        })?;

        let final_path = root.path.join(remote_path);
        if final_path.is_dir() {
            return Err(MirrorError::SuperDirectoryExists {
                super_dir: final_path,
                sub_dir: remote_path.to_path_buf(),
            });
        }
        if let Some(parent) = final_path.parent() {
            if parent.is_file() {
                return Err(MirrorError::SuperDirectoryExists {
                    super_dir: parent.to_path_buf(),
                    sub_dir: remote_path.to_path_buf(),
                });
            }
            std::fs::create_dir_all(parent)?;
        }
        let unfinished_path = with_unfinished_suffix(&final_path);
        // A restarted download whose `.unfinished` file already exists at the
        // right size is being resumed, not started over: re-truncating it
        // here would throw away every chunk already written to disk.
        let already_sized = std::fs::metadata(&unfinished_path)
            .map(|m| m.len() == remote.size)
            .unwrap_or(false);
        if !already_sized {
            create_sparse_file(&unfinished_path, remote.size)?;
        }

        let parent_id = self.ensure_directory_path(root.id, remote_path.parent());
        let name = remote_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let id = self.alloc_id();
        let chunks = remote
            .chunk_digests
            .iter()
            .zip(chunk_layout(remote.size))
            .map(|(_digest, (num, size))| Chunk::new(num, size))
            .collect();
        let mut tree = self.tree.lock().unwrap();
        tree.entries.insert(
            id,
            Entry {
                id,
                parent: Some(parent_id),
                root: root.id,
                name,
                size: remote.size,
                modified: SystemTime::now(),
                kind: EntryKind::File { chunks, unfinished: true },
                scanned: true,
            },
        );
        if let Some(parent_entry) = tree.entries.get_mut(&parent_id) {
            if let EntryKind::Directory { children } = &mut parent_entry.kind {
                children.push(id);
            }
        }
        Ok(id)
    }

    fn ensure_directory_path(&self, root: RootId, parent: Option<&Path>) -> EntryId {
        let mut current = self.root_dir_entry(root).expect("root directory entry exists");
        let Some(parent) = parent else { return current };
        for component in parent.components() {
            let name = component.as_os_str().to_string_lossy().into_owned();
            if name.is_empty() {
                continue;
            }
            current = match self.find_child(current, &name) {
                Some(existing) => existing,
                None => self.insert_directory(current, name, root, SystemTime::now()),
            };
        }
        current
    }

    /// Strip the `.unfinished` suffix once a download completes — invariant
    /// 5's "no `.unfinished` file remains" on completion.
    pub fn finalize_file(&self, id: EntryId) -> Result<(), MirrorError> {
        let path = self.resolve_path(id).ok_or(MirrorError::FileNotFound { path: PathBuf::new() })?;
        let unfinished = with_unfinished_suffix(&path);
        if unfinished.exists() {
            std::fs::rename(&unfinished, &path)?;
        }
        let mut tree = self.tree.lock().unwrap();
        if let Some(entry) = tree.entries.get_mut(&id) {
            if let EntryKind::File { unfinished, .. } = &mut entry.kind {
                *unfinished = false;
            }
        }
        Ok(())
    }

    pub fn to_wire(&self, id: EntryId) -> Option<SharedEntryWire> {
        let entry = self.get_entry_clone(id)?;
        let path = self.resolve_path(id)?;
        let root_path = self.root_path(entry.root)?;
        let relative = path.strip_prefix(&root_path).ok()?.to_string_lossy().into_owned();
        let digests = match &entry.kind {
            EntryKind::File { chunks, .. } => chunks.iter().filter_map(|c| c.digest).collect(),
            EntryKind::Directory { .. } => Vec::new(),
        };
        Some(SharedEntryWire {
            path: relative,
            is_dir: matches!(entry.kind, EntryKind::Directory { .. }),
            size: entry.size,
            modified_unix: entry
                .modified
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            chunk_digests: digests,
        })
    }

    pub fn children(&self, id: EntryId) -> Vec<EntryId> {
        let tree = self.tree.lock().unwrap();
        match tree.entries.get(&id).map(|e| &e.kind) {
            Some(EntryKind::Directory { children }) => children.clone(),
            _ => Vec::new(),
        }
    }

    /// Resolve a `/`-separated relative path under a specific root, walking
    /// one path component at a time via [`Mirror::find_child`]. Used by
    /// `GET_ENTRIES`/`GET_HASHES` handlers, which address entries by path
    /// rather than by the local-only [`EntryId`].
    pub fn resolve_relative(&self, root: RootId, relative: &str) -> Option<EntryId> {
        let mut current = self.root_dir_entry(root)?;
        for component in relative.split('/').filter(|c| !c.is_empty()) {
            current = self.find_child(current, component)?;
        }
        Some(current)
    }

    /// Resolve a relative path against every shared root, returning the
    /// first match. Used when a `GET_ENTRIES`/`GET_HASHES` request doesn't
    /// scope itself to a specific root.
    pub fn resolve_any_root(&self, relative: &str) -> Option<(RootId, EntryId)> {
        for root in self.roots() {
            if let Some(id) = self.resolve_relative(root.id, relative) {
                return Some((root.id, id));
            }
        }
        None
    }

    /// Locate a chunk's bytes on disk: the owning file's path, offset, and
    /// size, resolved fresh each call since renames move the backing file
    /// independently of the chunk index. Returns `None` if the chunk isn't
    /// fully known yet (per spec: reading a partial chunk past `known_bytes`
    /// is an error, so callers must not attempt it).
    pub fn chunk_file_ref(
        &self,
        entry: EntryId,
        chunk_num: u32,
    ) -> Option<crate::chunk::store::ChunkFileRef> {
        let path = self.resolve_path(entry)?;
        let tree = self.tree.lock().unwrap();
        let e = tree.entries.get(&entry)?;
        let EntryKind::File { chunks, unfinished } = &e.kind else { return None };
        let chunk = chunks.iter().find(|c| c.num == chunk_num)?;
        if !chunk.is_complete() {
            return None;
        }
        let path = if *unfinished { with_unfinished_suffix(&path) } else { path };
        Some(crate::chunk::store::ChunkFileRef {
            path,
            offset: chunk_num as u64 * crate::config::CHUNK_SIZE,
            size: chunk.size,
        })
    }

    /// Path to open for writing incoming chunk bytes: the `.unfinished` file
    /// while a download is still in progress, the final path once it has
    /// been finalized. Used by the download manager, which writes bytes as
    /// `GET_CHUNK` replies arrive rather than all at once.
    pub fn write_path(&self, entry: EntryId) -> Option<PathBuf> {
        let path = self.resolve_path(entry)?;
        let tree = self.tree.lock().unwrap();
        let e = tree.entries.get(&entry)?;
        let EntryKind::File { unfinished, .. } = &e.kind else { return None };
        Some(if *unfinished { with_unfinished_suffix(&path) } else { path })
    }

    /// Total size of everything currently mirrored under a root, by summing
    /// file sizes recursively — used to advertise our shared-bytes total in
    /// `GET_ENTRIES` replies and presence beacons.
    pub fn root_total_size(&self, root: RootId) -> u64 {
        let Some(dir) = self.root_dir_entry(root) else { return 0 };
        self.subtree_size(dir)
    }

    fn subtree_size(&self, id: EntryId) -> u64 {
        let tree = self.tree.lock().unwrap();
        match tree.entries.get(&id).map(|e| e.kind.clone()) {
            Some(EntryKind::File { .. }) => tree.entries.get(&id).map(|e| e.size).unwrap_or(0),
            Some(EntryKind::Directory { children }) => {
                drop(tree);
                children.iter().map(|&c| self.subtree_size(c)).sum()
            }
            None => 0,
        }
    }
}

impl Default for Mirror {
    fn default() -> Self {
        Self::new()
    }
}

fn with_unfinished_suffix(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(UNFINISHED_SUFFIX);
    PathBuf::from(os)
}

fn create_sparse_file(path: &Path, size: u64) -> std::io::Result<()> {
    let file = std::fs::File::create(path)?;
    file.set_len(size)?;
    Ok(())
}

pub fn available_space(path: &Path) -> std::io::Result<u64> {
    // `statvfs`-equivalent information isn't in std; approximate via the
    // filesystem's reported capacity through `sysinfo`'s disk listing,
    // falling back to "plenty" when the path doesn't match a known mount
    // (e.g. under a tmpfs test directory).
    use sysinfo::Disks;
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<u64> = None;
    let mut best_len = 0usize;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let len = mount.components().count();
            if len >= best_len {
                best_len = len;
                best = Some(disk.available_space());
            }
        }
    }
    Ok(best.unwrap_or(u64::MAX))
}
