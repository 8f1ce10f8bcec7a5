#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// btrfs objectid of the first regular inode; the recovery index roots the
/// directory tree at the subvolume's top-level directory, which carries it.
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;

/// Preferred I/O size reported to the VFS for rescued files.
pub const RESCUE_BLKSIZE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    pub const ROOT: Self = Self(BTRFS_FIRST_FREE_OBJECTID);
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session-local identifier for an open file.
///
/// Allocated by the open-handle table on `open` and invalidated on
/// `release`; never reused within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node kind as recorded by the recovery index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InodeKind {
    File,
    Directory,
    Symlink,
}

/// One contiguous run of file bytes on the underlying device.
///
/// `logical` is the byte offset within the file, `physical` the byte offset
/// on the device/image. Extents recovered from a damaged volume may overlap,
/// leave gaps, or point past the end of the image — consumers must not
/// assume the set for one inode is well-formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub logical: u64,
    pub length: u64,
    pub physical: u64,
}

impl Extent {
    /// One past the last logical byte, saturating on overflow.
    #[must_use]
    pub fn logical_end(&self) -> u64 {
        self.logical.saturating_add(self.length)
    }

    /// One past the last physical byte, saturating on overflow.
    #[must_use]
    pub fn physical_end(&self) -> u64 {
        self.physical.saturating_add(self.length)
    }

    /// Whether this extent covers any byte of `[start, end)`.
    #[must_use]
    pub fn intersects(&self, start: u64, end: u64) -> bool {
        self.logical < end && start < self.logical_end()
    }
}

/// Inode metadata reconstructed by the recovery phase.
///
/// Immutable for the lifetime of a mount session. Timestamps are not
/// recovered; the filesystem layer synthesizes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeMeta {
    pub ino: InodeNumber,
    pub kind: InodeKind,
    /// File size in bytes (0 for directories whose size was lost).
    pub size: u64,
    /// POSIX permission bits (lower 12 bits of mode).
    pub mode: u16,
    /// Hard link count if recovered, else 1.
    pub nlink: u32,
    /// Symlink target bytes; `None` unless `kind` is `Symlink`.
    pub symlink_target: Option<Vec<u8>>,
}

impl InodeMeta {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.kind == InodeKind::Symlink
    }
}

/// A directory entry as recorded by the index.
///
/// Names are raw bytes — a rescued volume may hold names that are not
/// valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEntry {
    pub name: Vec<u8>,
    pub ino: InodeNumber,
    pub kind: InodeKind,
}

impl ChildEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_first_free_objectid() {
        assert_eq!(InodeNumber::ROOT.0, BTRFS_FIRST_FREE_OBJECTID);
    }

    #[test]
    fn extent_end_saturates() {
        let e = Extent {
            logical: u64::MAX - 10,
            length: 100,
            physical: 0,
        };
        assert_eq!(e.logical_end(), u64::MAX);
    }

    #[test]
    fn extent_intersection() {
        let e = Extent {
            logical: 100,
            length: 50,
            physical: 0,
        };
        assert!(e.intersects(0, 101));
        assert!(e.intersects(149, 200));
        assert!(!e.intersects(150, 200));
        assert!(!e.intersects(0, 100));
        assert!(!e.intersects(120, 120));
    }

    #[test]
    fn child_entry_lossy_name() {
        let entry = ChildEntry {
            name: vec![0x66, 0x6f, 0x6f, 0xff],
            ino: InodeNumber(300),
            kind: InodeKind::File,
        };
        assert!(entry.name_str().starts_with("foo"));
    }
}
