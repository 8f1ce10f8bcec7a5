#![forbid(unsafe_code)]
//! Rescue filesystem semantics: the bridge from the recovered metadata
//! index and raw device bytes to VFS-level operations.
//!
//! [`RescueFs`] implements [`FsOps`], the internal interface the FUSE
//! adapter and the test harness call. It owns nothing but the open-handle
//! table; the index and the block reader are shared, read-only
//! collaborators. Every operation is best-effort: a request that touches
//! data the recovery scan could not place is answered with zero-filled
//! bytes and a warning, not an error.

use parking_lot::Mutex;
use rfs_block::BlockReader;
use rfs_error::{RescueError, Result};
use rfs_extent::{execute_read, plan_read};
use rfs_index::MetadataIndex;
use rfs_types::{ChildEntry, HandleId, InodeKind, InodeMeta, InodeNumber, RESCUE_BLKSIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{trace, warn};

// ── VFS-level structures ────────────────────────────────────────────────────

/// Inode attributes returned by [`FsOps::getattr`] and [`FsOps::lookup`].
///
/// The semantics-level stat structure, analogous to POSIX `struct stat`.
/// The recovery index does not carry timestamps or ownership, so those
/// fields are synthesized: all four timestamps are the session's attribute
/// epoch (captured once at construction), and files belong to the
/// recovering user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    /// File size in bytes.
    pub size: u64,
    /// Number of 512-byte blocks the size spans.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub kind: InodeKind,
    /// POSIX permission bits (lower 12 bits of mode).
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Preferred I/O block size.
    pub blksize: u32,
}

/// A directory entry returned by [`FsOps::readdir`].
///
/// The `offset` field is an opaque cookie for resuming iteration — the
/// kernel passes it back on subsequent `readdir` calls so the
/// implementation can skip already-returned entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    /// Opaque offset cookie for readdir continuation.
    pub offset: u64,
    pub kind: InodeKind,
    /// Entry name (filename component, not a full path).
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Outcome of a data read: the bytes plus degradation accounting.
///
/// `unreadable_bytes > 0` marks a partial read — the call still succeeded,
/// the gaps are zero-filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub bytes: Vec<u8>,
    pub sparse_bytes: u64,
    pub unreadable_bytes: u64,
}

// ── FsOps trait ─────────────────────────────────────────────────────────────

/// Read-only VFS operations over a rescued volume.
///
/// This is the internal interface the FUSE adapter and the test suites
/// call. Errors map to POSIX errnos via [`RescueError::to_errno`]. The
/// trait is `Send + Sync` so the serving layer can dispatch calls from
/// multiple threads concurrently; implementations hold no per-call state
/// outside the open-handle table.
pub trait FsOps: Send + Sync {
    /// Get attributes by inode number.
    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr>;

    /// Look up a directory entry by name.
    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr>;

    /// List directory entries starting from an offset cookie (0 first).
    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>>;

    /// Open a file, allocating a session-local handle.
    fn open(&self, ino: InodeNumber) -> Result<HandleId>;

    /// Release an open handle. The id is stale afterwards.
    fn release(&self, handle: HandleId) -> Result<()>;

    /// Read file data by inode.
    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<ReadOutcome>;

    /// Read file data through an open handle.
    fn read_handle(&self, handle: HandleId, offset: u64, size: u32) -> Result<ReadOutcome>;

    /// Read the target of a symbolic link (never followed here).
    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>>;
}

// ── Open-handle table ───────────────────────────────────────────────────────

/// Session-local open-file table.
///
/// Handle ids are allocated monotonically and never reused within a
/// session, so a released id can be told apart from one that was never
/// issued. Only the map itself needs the lock; allocation is atomic.
#[derive(Debug, Default)]
struct HandleTable {
    next: AtomicU64,
    open: Mutex<HashMap<u64, InodeNumber>>,
}

impl HandleTable {
    fn insert(&self, ino: InodeNumber) -> HandleId {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.open.lock().insert(id, ino);
        HandleId(id)
    }

    fn resolve(&self, handle: HandleId) -> Option<InodeNumber> {
        self.open.lock().get(&handle.0).copied()
    }

    fn remove(&self, handle: HandleId) -> Option<InodeNumber> {
        self.open.lock().remove(&handle.0)
    }

    fn len(&self) -> usize {
        self.open.lock().len()
    }
}

// ── RescueFs ────────────────────────────────────────────────────────────────

/// Rescue filesystem over a metadata index and a raw block reader.
///
/// All state except the handle table is immutable after construction, so
/// concurrent calls need no coordination beyond the reader's own
/// (pread-style, lock-free) access.
pub struct RescueFs {
    index: Arc<dyn MetadataIndex>,
    reader: Arc<dyn BlockReader>,
    handles: HandleTable,
    /// Synthesized timestamp for every inode: the moment this session was
    /// created. Constant within a session, so repeated getattr calls are
    /// identical.
    attr_epoch: SystemTime,
    uid: u32,
    gid: u32,
}

impl std::fmt::Debug for RescueFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RescueFs")
            .field("device_len", &self.reader.len_bytes())
            .field("open_handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl RescueFs {
    /// Create a rescue filesystem over `index` and `reader`.
    ///
    /// Ownership is not reconstructed by the scan; files are presented as
    /// root-owned with their recovered permission bits. Callers that mount
    /// as an unprivileged user pass that user via [`Self::with_owner`].
    #[must_use]
    pub fn new(index: Arc<dyn MetadataIndex>, reader: Arc<dyn BlockReader>) -> Self {
        Self::with_owner(index, reader, 0, 0)
    }

    /// Create with explicit presented ownership (tests, unusual setups).
    #[must_use]
    pub fn with_owner(
        index: Arc<dyn MetadataIndex>,
        reader: Arc<dyn BlockReader>,
        uid: u32,
        gid: u32,
    ) -> Self {
        Self {
            index,
            reader,
            handles: HandleTable::default(),
            attr_epoch: SystemTime::now(),
            uid,
            gid,
        }
    }

    /// Inode number of the directory tree root.
    #[must_use]
    pub fn root(&self) -> InodeNumber {
        self.index.root()
    }

    /// Number of currently open handles.
    #[must_use]
    pub fn open_handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Resolve a `/`-separated path to an inode, walking directory entries
    /// from the root.
    ///
    /// The walk is bounded by the component count of the input, so a
    /// cyclic directory graph in a badly corrupted index cannot hang the
    /// caller. `.` components are skipped; `..` is refused because parent
    /// linkage is not reconstructed by the scan.
    pub fn resolve_path(&self, path: &str) -> Result<InodeNumber> {
        let mut current = self.index.root();
        for component in path.split('/') {
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." {
                return Err(RescueError::NotFound("..".into()));
            }
            let meta = self.meta(current)?;
            if !meta.is_dir() {
                return Err(RescueError::NotDirectory);
            }
            current = self
                .index
                .lookup_child(current, component.as_bytes())
                .ok_or_else(|| RescueError::NotFound(component.to_owned()))?;
        }
        Ok(current)
    }

    fn meta(&self, ino: InodeNumber) -> Result<InodeMeta> {
        self.index
            .inode(ino)
            .ok_or_else(|| RescueError::NotFound(format!("inode {ino}")))
    }

    /// Convert recovered metadata into the VFS attribute structure.
    fn meta_to_attr(&self, meta: &InodeMeta) -> InodeAttr {
        InodeAttr {
            ino: meta.ino,
            size: meta.size,
            blocks: meta.size.div_ceil(512),
            atime: self.attr_epoch,
            mtime: self.attr_epoch,
            ctime: self.attr_epoch,
            crtime: self.attr_epoch,
            kind: meta.kind,
            perm: meta.mode & 0o7777,
            nlink: meta.nlink.max(1),
            uid: self.uid,
            gid: self.gid,
            blksize: RESCUE_BLKSIZE,
        }
    }

    fn read_ino(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<ReadOutcome> {
        let meta = self.meta(ino)?;
        if meta.is_dir() {
            return Err(RescueError::IsDirectory);
        }

        let extents = self.index.extents(ino);
        let plan = plan_read(&extents, meta.size, offset, size, self.reader.len_bytes());
        let result = execute_read(&plan, self.reader.as_ref());

        if result.unreadable_bytes > 0 {
            warn!(
                ino = %ino,
                offset,
                size,
                unreadable = result.unreadable_bytes,
                "partial read: unreadable source ranges zero-filled"
            );
        } else {
            trace!(ino = %ino, offset, size, len = result.bytes.len(), "read");
        }

        Ok(ReadOutcome {
            bytes: result.bytes,
            sparse_bytes: result.sparse_bytes,
            unreadable_bytes: result.unreadable_bytes,
        })
    }
}

impl FsOps for RescueFs {
    fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        let meta = self.meta(ino)?;
        Ok(self.meta_to_attr(&meta))
    }

    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> Result<InodeAttr> {
        let parent_meta = self.meta(parent)?;
        if !parent_meta.is_dir() {
            return Err(RescueError::NotDirectory);
        }

        let child = self
            .index
            .lookup_child(parent, name.as_encoded_bytes())
            .ok_or_else(|| RescueError::NotFound(name.to_string_lossy().into_owned()))?;
        let child_meta = self.meta(child)?;
        Ok(self.meta_to_attr(&child_meta))
    }

    fn readdir(&self, ino: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        let meta = self.meta(ino)?;
        if !meta.is_dir() {
            return Err(RescueError::NotDirectory);
        }

        // `.` and `..` are synthesized: parent linkage is not recovered,
        // so `..` reports the directory itself. Children follow in index
        // order; cookies are 1-indexed positions.
        let mut all: Vec<(InodeNumber, InodeKind, Vec<u8>)> = vec![
            (ino, InodeKind::Directory, b".".to_vec()),
            (ino, InodeKind::Directory, b"..".to_vec()),
        ];
        all.extend(
            self.index
                .list_children(ino)
                .into_iter()
                .map(|ChildEntry { name, ino, kind }| (ino, kind, name)),
        );

        let entries = all
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| (*idx as u64) >= offset)
            .map(|(idx, (ino, kind, name))| DirEntry {
                ino,
                offset: (idx as u64) + 1,
                kind,
                name,
            })
            .collect();
        Ok(entries)
    }

    fn open(&self, ino: InodeNumber) -> Result<HandleId> {
        let meta = self.meta(ino)?;
        if meta.is_dir() {
            return Err(RescueError::IsDirectory);
        }
        let handle = self.handles.insert(ino);
        trace!(ino = %ino, handle = %handle, "open");
        Ok(handle)
    }

    fn release(&self, handle: HandleId) -> Result<()> {
        match self.handles.remove(handle) {
            Some(ino) => {
                trace!(ino = %ino, handle = %handle, "release");
                Ok(())
            }
            None => Err(RescueError::StaleHandle(handle.0)),
        }
    }

    fn read(&self, ino: InodeNumber, offset: u64, size: u32) -> Result<ReadOutcome> {
        self.read_ino(ino, offset, size)
    }

    fn read_handle(&self, handle: HandleId, offset: u64, size: u32) -> Result<ReadOutcome> {
        let ino = self
            .handles
            .resolve(handle)
            .ok_or(RescueError::StaleHandle(handle.0))?;
        self.read_ino(ino, offset, size)
    }

    fn readlink(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let meta = self.meta(ino)?;
        if !meta.is_symlink() {
            return Err(RescueError::NotSymlink);
        }
        meta.symlink_target
            .ok_or_else(|| RescueError::Corrupt(format!("symlink {ino} has no recovered target")))
    }
}
