#![forbid(unsafe_code)]
//! Metadata index access.
//!
//! The recovery phase scans the raw device and rebuilds inodes, directory
//! entries, and extent maps despite missing or inconsistent on-disk
//! structures. This crate defines the read-only oracle interface the rescue
//! filesystem consumes, plus [`MemIndex`], the in-memory realization the
//! scanner fills and the test suites construct directly.
//!
//! The index may be incomplete: an inode can exist without extents, a
//! directory entry can point at an inode the scan never recovered, and the
//! extent set for one inode can overlap or leave gaps. Consumers treat all
//! of that as expected input, never as an error in this layer.

use rfs_types::{ChildEntry, Extent, InodeKind, InodeMeta, InodeNumber};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Read-only oracle over the recovered metadata.
///
/// All methods are total: absence is `None`/empty, never a panic. Results
/// are deterministic across repeated calls within one session — `MemIndex`
/// guarantees this by preserving insertion order for children and extents.
pub trait MetadataIndex: Send + Sync {
    /// Inode number of the directory tree root.
    fn root(&self) -> InodeNumber;

    /// Metadata for `ino`, if the scan recovered it.
    fn inode(&self, ino: InodeNumber) -> Option<InodeMeta>;

    /// Child of `parent` named `name` (raw bytes), if present.
    fn lookup_child(&self, parent: InodeNumber, name: &[u8]) -> Option<InodeNumber>;

    /// All children of `ino` in index order.
    ///
    /// Empty for non-directories and for directories with no recovered
    /// entries.
    fn list_children(&self, ino: InodeNumber) -> Vec<ChildEntry>;

    /// Extents of `ino` in index order.
    ///
    /// Index order matters: when extents overlap, the one indexed last wins
    /// within the overlap.
    fn extents(&self, ino: InodeNumber) -> Vec<Extent>;
}

// ── In-memory index ─────────────────────────────────────────────────────────

/// In-memory metadata index.
///
/// Filled by the recovery scanner through the `insert_*` methods; the
/// insertion order of children and extents is preserved and is the "index
/// order" the rest of the system relies on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemIndex {
    root: Option<InodeNumber>,
    inodes: HashMap<u64, InodeMeta>,
    children: HashMap<u64, Vec<ChildEntry>>,
    extents: HashMap<u64, Vec<Extent>>,
}

impl MemIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index rooted at an already-inserted (or to-be-inserted)
    /// directory inode.
    #[must_use]
    pub fn with_root(root: InodeNumber) -> Self {
        Self {
            root: Some(root),
            ..Self::default()
        }
    }

    /// Record a recovered inode. A later insert for the same number
    /// replaces the earlier one (the scan trusts the most recent copy).
    pub fn insert_inode(&mut self, meta: InodeMeta) {
        self.inodes.insert(meta.ino.0, meta);
    }

    /// Record a directory entry under `parent`.
    pub fn insert_child(
        &mut self,
        parent: InodeNumber,
        name: impl Into<Vec<u8>>,
        ino: InodeNumber,
        kind: InodeKind,
    ) {
        self.children.entry(parent.0).or_default().push(ChildEntry {
            name: name.into(),
            ino,
            kind,
        });
    }

    /// Record an extent for `ino`, appended after everything indexed so far.
    pub fn insert_extent(&mut self, ino: InodeNumber, extent: Extent) {
        self.extents.entry(ino.0).or_default().push(extent);
    }

    /// Number of recovered inodes.
    #[must_use]
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }
}

impl MetadataIndex for MemIndex {
    fn root(&self) -> InodeNumber {
        self.root.unwrap_or(InodeNumber::ROOT)
    }

    fn inode(&self, ino: InodeNumber) -> Option<InodeMeta> {
        self.inodes.get(&ino.0).cloned()
    }

    fn lookup_child(&self, parent: InodeNumber, name: &[u8]) -> Option<InodeNumber> {
        self.children
            .get(&parent.0)?
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.ino)
    }

    fn list_children(&self, ino: InodeNumber) -> Vec<ChildEntry> {
        self.children.get(&ino.0).cloned().unwrap_or_default()
    }

    fn extents(&self, ino: InodeNumber) -> Vec<Extent> {
        self.extents.get(&ino.0).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_meta(ino: u64) -> InodeMeta {
        InodeMeta {
            ino: InodeNumber(ino),
            kind: InodeKind::Directory,
            size: 0,
            mode: 0o755,
            nlink: 2,
            symlink_target: None,
        }
    }

    fn file_meta(ino: u64, size: u64) -> InodeMeta {
        InodeMeta {
            ino: InodeNumber(ino),
            kind: InodeKind::File,
            size,
            mode: 0o644,
            nlink: 1,
            symlink_target: None,
        }
    }

    #[test]
    fn empty_index_defaults_to_btrfs_root() {
        let ix = MemIndex::new();
        assert_eq!(ix.root(), InodeNumber::ROOT);
        assert!(ix.inode(InodeNumber::ROOT).is_none());
        assert!(ix.list_children(InodeNumber::ROOT).is_empty());
        assert!(ix.extents(InodeNumber(5)).is_empty());
    }

    #[test]
    fn lookup_finds_child_by_raw_name() {
        let mut ix = MemIndex::with_root(InodeNumber::ROOT);
        ix.insert_inode(dir_meta(256));
        ix.insert_inode(file_meta(300, 42));
        ix.insert_child(
            InodeNumber::ROOT,
            &b"report.txt"[..],
            InodeNumber(300),
            InodeKind::File,
        );

        assert_eq!(
            ix.lookup_child(InodeNumber::ROOT, b"report.txt"),
            Some(InodeNumber(300))
        );
        assert_eq!(ix.lookup_child(InodeNumber::ROOT, b"missing.txt"), None);
    }

    #[test]
    fn children_preserve_insertion_order() {
        let mut ix = MemIndex::with_root(InodeNumber::ROOT);
        ix.insert_inode(dir_meta(256));
        for (i, name) in [&b"zz"[..], b"aa", b"mm"].iter().enumerate() {
            ix.insert_child(
                InodeNumber::ROOT,
                *name,
                InodeNumber(300 + i as u64),
                InodeKind::File,
            );
        }

        let listed: Vec<Vec<u8>> = ix
            .list_children(InodeNumber::ROOT)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(listed, vec![b"zz".to_vec(), b"aa".to_vec(), b"mm".to_vec()]);

        // Deterministic across repeated calls.
        assert_eq!(
            ix.list_children(InodeNumber::ROOT),
            ix.list_children(InodeNumber::ROOT)
        );
    }

    #[test]
    fn extents_preserve_index_order() {
        let mut ix = MemIndex::new();
        let first = Extent {
            logical: 0,
            length: 10,
            physical: 1000,
        };
        let second = Extent {
            logical: 5,
            length: 10,
            physical: 2000,
        };
        ix.insert_extent(InodeNumber(5), first);
        ix.insert_extent(InodeNumber(5), second);

        assert_eq!(ix.extents(InodeNumber(5)), vec![first, second]);
    }

    #[test]
    fn reinserting_an_inode_replaces_it() {
        let mut ix = MemIndex::new();
        ix.insert_inode(file_meta(300, 10));
        ix.insert_inode(file_meta(300, 99));
        assert_eq!(ix.inode(InodeNumber(300)).map(|m| m.size), Some(99));
        assert_eq!(ix.inode_count(), 1);
    }
}
