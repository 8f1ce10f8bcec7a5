#![forbid(unsafe_code)]
//! End-to-end rescue semantics over an in-memory index and image:
//! byte-for-byte extraction, sparse holes, overlap resolution, and
//! degradation on unreadable ranges.

use rfs_block::MemReader;
use rfs_core::{FsOps, RescueFs};
use rfs_error::RescueError;
use rfs_index::MemIndex;
use rfs_types::{Extent, InodeKind, InodeMeta, InodeNumber};
use std::ffi::OsStr;
use std::sync::Arc;

const ROOT: InodeNumber = InodeNumber::ROOT;

fn meta(ino: u64, kind: InodeKind, size: u64) -> InodeMeta {
    InodeMeta {
        ino: InodeNumber(ino),
        kind,
        size,
        mode: if kind == InodeKind::Directory {
            0o755
        } else {
            0o644
        },
        nlink: 1,
        symlink_target: None,
    }
}

/// A small rescued volume:
///
/// ```text
/// /                       (256)
/// ├── hello.txt           (300)  32 bytes, fully covered
/// ├── sparse.bin          (301)  4096 bytes, no extents
/// ├── patched.log         (302)  overlapping extents, later wins
/// ├── truncated.dat       (303)  extent runs past the image end
/// └── docs/               (310)
///     └── readme -> ../hello.txt   (311)
/// ```
fn rescued_volume() -> (RescueFs, Vec<u8>) {
    let mut image = vec![0_u8; 4096];
    for (i, b) in image.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    let mut ix = MemIndex::with_root(ROOT);
    ix.insert_inode(meta(256, InodeKind::Directory, 0));
    ix.insert_inode(meta(300, InodeKind::File, 32));
    ix.insert_inode(meta(301, InodeKind::File, 4096));
    ix.insert_inode(meta(302, InodeKind::File, 64));
    ix.insert_inode(meta(303, InodeKind::File, 128));
    ix.insert_inode(meta(310, InodeKind::Directory, 0));
    ix.insert_inode(InodeMeta {
        symlink_target: Some(b"../hello.txt".to_vec()),
        ..meta(311, InodeKind::Symlink, 12)
    });

    ix.insert_child(ROOT, &b"hello.txt"[..], InodeNumber(300), InodeKind::File);
    ix.insert_child(ROOT, &b"sparse.bin"[..], InodeNumber(301), InodeKind::File);
    ix.insert_child(ROOT, &b"patched.log"[..], InodeNumber(302), InodeKind::File);
    ix.insert_child(ROOT, &b"truncated.dat"[..], InodeNumber(303), InodeKind::File);
    ix.insert_child(ROOT, &b"docs"[..], InodeNumber(310), InodeKind::Directory);
    ix.insert_child(
        InodeNumber(310),
        &b"readme"[..],
        InodeNumber(311),
        InodeKind::Symlink,
    );

    ix.insert_extent(
        InodeNumber(300),
        Extent {
            logical: 0,
            length: 32,
            physical: 100,
        },
    );
    // patched.log: a full base extent, then a 16-byte rewrite indexed later.
    ix.insert_extent(
        InodeNumber(302),
        Extent {
            logical: 0,
            length: 64,
            physical: 1000,
        },
    );
    ix.insert_extent(
        InodeNumber(302),
        Extent {
            logical: 16,
            length: 16,
            physical: 2000,
        },
    );
    // truncated.dat: the second half of the extent lies past the image end.
    ix.insert_extent(
        InodeNumber(303),
        Extent {
            logical: 0,
            length: 128,
            physical: 4032,
        },
    );

    let fs = RescueFs::with_owner(
        Arc::new(ix),
        Arc::new(MemReader::new(image.clone())),
        1000,
        1000,
    );
    (fs, image)
}

#[test]
fn fully_covered_read_is_byte_for_byte() {
    let (fs, image) = rescued_volume();
    let out = fs.read(InodeNumber(300), 0, 32).expect("read hello.txt");
    assert_eq!(out.bytes, &image[100..132]);
    assert_eq!(out.sparse_bytes, 0);
    assert_eq!(out.unreadable_bytes, 0);
}

#[test]
fn sparse_file_reads_as_zeros() {
    let (fs, _) = rescued_volume();
    let out = fs.read(InodeNumber(301), 0, 4096).expect("read sparse.bin");
    assert_eq!(out.bytes.len(), 4096);
    assert!(out.bytes.iter().all(|b| *b == 0));
    assert_eq!(out.sparse_bytes, 4096);
    assert_eq!(out.unreadable_bytes, 0);
}

#[test]
fn read_is_clipped_to_inode_size() {
    let (fs, _) = rescued_volume();
    let out = fs.read(InodeNumber(300), 20, 100).expect("read past EOF");
    assert_eq!(out.bytes.len(), 12);

    let empty = fs.read(InodeNumber(300), 32, 100).expect("read at EOF");
    assert!(empty.bytes.is_empty());

    let way_past = fs.read(InodeNumber(300), 1 << 40, 100).expect("read far past EOF");
    assert!(way_past.bytes.is_empty());
}

#[test]
fn overlapping_extents_resolve_last_wins() {
    let (fs, image) = rescued_volume();
    let out = fs.read(InodeNumber(302), 0, 64).expect("read patched.log");
    assert_eq!(&out.bytes[..16], &image[1000..1016]);
    assert_eq!(&out.bytes[16..32], &image[2000..2016], "rewrite wins");
    assert_eq!(&out.bytes[32..], &image[1032..1064]);
}

#[test]
fn extent_past_image_end_zero_fills_tail() {
    let (fs, image) = rescued_volume();
    let out = fs.read(InodeNumber(303), 0, 128).expect("read truncated.dat");
    assert_eq!(&out.bytes[..64], &image[4032..4096]);
    assert!(out.bytes[64..].iter().all(|b| *b == 0));
    assert_eq!(out.unreadable_bytes, 64);
}

#[test]
fn lookup_missing_name_is_not_found() {
    let (fs, _) = rescued_volume();
    let err = fs.lookup(ROOT, OsStr::new("missing.txt")).unwrap_err();
    assert!(matches!(err, RescueError::NotFound(_)));
    assert_eq!(err.to_errno(), libc::ENOENT);
}

#[test]
fn path_walk_reaches_nested_symlink() {
    let (fs, _) = rescued_volume();
    let ino = fs.resolve_path("/docs/readme").expect("resolve symlink path");
    assert_eq!(ino, InodeNumber(311));
    assert_eq!(
        fs.readlink(ino).expect("readlink"),
        b"../hello.txt".to_vec()
    );
}

#[test]
fn readdir_and_getattr_are_idempotent_within_a_session() {
    let (fs, _) = rescued_volume();
    let first = fs.readdir(ROOT, 0).expect("readdir");
    let second = fs.readdir(ROOT, 0).expect("readdir again");
    assert_eq!(first, second);

    let a = fs.getattr(InodeNumber(302)).expect("getattr");
    let b = fs.getattr(InodeNumber(302)).expect("getattr again");
    assert_eq!(a, b);

    let l1 = fs.lookup(ROOT, OsStr::new("docs")).expect("lookup");
    let l2 = fs.lookup(ROOT, OsStr::new("docs")).expect("lookup again");
    assert_eq!(l1, l2);
}

#[test]
fn whole_tree_extraction_via_handles() {
    let (fs, image) = rescued_volume();
    let ino = fs.resolve_path("/hello.txt").expect("resolve");
    let handle = fs.open(ino).expect("open");

    // Copy out in small chunks, the way `cp` drains a file.
    let mut copied = Vec::new();
    let mut offset = 0_u64;
    loop {
        let chunk = fs.read_handle(handle, offset, 10).expect("chunk read");
        if chunk.bytes.is_empty() {
            break;
        }
        offset += chunk.bytes.len() as u64;
        copied.extend_from_slice(&chunk.bytes);
    }
    fs.release(handle).expect("release");

    assert_eq!(copied, &image[100..132]);
}
