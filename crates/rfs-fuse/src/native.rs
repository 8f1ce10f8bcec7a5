//! FUSE-backed rescue session for Linux and macOS.
//!
//! Kernel requests arrive via the `fuser` crate, get forwarded to
//! `rfs_core::RescueFs`, and errors are mapped through
//! [`RescueError::to_errno`]. The session owns the mount lifecycle; the
//! adapter ([`RescueFuse`]) is a thin translation layer with no state of
//! its own beyond shared metrics.

use crate::{
    AtomicMetrics, MetricsSnapshot, MountOptions, MountRegistry, SessionPhase,
    validate_mountpoint,
};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use parking_lot::Mutex;
use rfs_block::BlockReader;
use rfs_core::{FsOps, InodeAttr, RescueFs};
use rfs_error::{RescueError, Result};
use rfs_index::MetadataIndex;
use rfs_types::{HandleId, InodeKind, InodeNumber, RESCUE_BLKSIZE};
use std::ffi::OsStr;
use std::os::raw::c_int;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{info, trace, warn};

/// TTL for cached attributes and entries. The rescued view is immutable
/// for the life of the mount, so a generous TTL is safe.
const ATTR_TTL: Duration = Duration::from_secs(60);

/// Poll interval of the serve loop waiting for the shutdown flag.
const SERVE_POLL: Duration = Duration::from_millis(100);

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuse_kind(kind: InodeKind) -> FileType {
    match kind {
        InodeKind::File => FileType::RegularFile,
        InodeKind::Directory => FileType::Directory,
        InodeKind::Symlink => FileType::Symlink,
    }
}

fn to_file_attr(attr: &InodeAttr) -> FileAttr {
    FileAttr {
        ino: attr.ino.0,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind: to_fuse_kind(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: attr.blksize,
        flags: 0,
    }
}

/// Whether open flags request write access (mutating intent).
fn open_flags_writable(flags: i32) -> bool {
    (flags & libc::O_ACCMODE) != libc::O_RDONLY
}

// ── Error reply context ─────────────────────────────────────────────────────

/// Structured context for a failed operation: logs once, yields the errno.
struct OpError<'a> {
    error: &'a RescueError,
    operation: &'static str,
    ino: u64,
    offset: Option<u64>,
}

impl OpError<'_> {
    fn log_and_errno(&self) -> c_int {
        let errno = self.error.to_errno();
        // ENOENT on lookup is normal — log at trace instead of warn.
        if errno == libc::ENOENT {
            trace!(
                op = self.operation,
                ino = self.ino,
                errno,
                error = %self.error,
                "rescue op returned ENOENT"
            );
        } else {
            warn!(
                op = self.operation,
                ino = self.ino,
                offset = self.offset,
                errno,
                error = %self.error,
                "rescue op failed"
            );
        }
        errno
    }
}

// ── FUSE adapter ────────────────────────────────────────────────────────────

/// FUSE adapter delegating all reads to a shared [`RescueFs`].
///
/// Every mutating callback replies `EROFS` before touching anything —
/// the read-only policy is unconditional, independent of mount options.
struct RescueFuse {
    ops: Arc<RescueFs>,
    metrics: Arc<AtomicMetrics>,
    device_len: u64,
}

impl RescueFuse {
    fn reply_read_only(&self, operation: &'static str, ino: u64, reply: ReplyEmpty) {
        self.metrics.record_err();
        let err = RescueError::ReadOnly;
        let ctx = OpError {
            error: &err,
            operation,
            ino,
            offset: None,
        };
        reply.error(ctx.log_and_errno());
    }

    fn reply_read_only_entry(&self, operation: &'static str, ino: u64, reply: ReplyEntry) {
        self.metrics.record_err();
        let err = RescueError::ReadOnly;
        let ctx = OpError {
            error: &err,
            operation,
            ino,
            offset: None,
        };
        reply.error(ctx.log_and_errno());
    }
}

impl Filesystem for RescueFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> std::result::Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {}

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.ops.getattr(InodeNumber(ino)) {
            Ok(attr) => {
                self.metrics.record_ok();
                reply.attr(&ATTR_TTL, &to_file_attr(&attr));
            }
            Err(e) => {
                self.metrics.record_err();
                let ctx = OpError {
                    error: &e,
                    operation: "getattr",
                    ino,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.ops.lookup(InodeNumber(parent), name) {
            Ok(attr) => {
                self.metrics.record_ok();
                reply.entry(&ATTR_TTL, &to_file_attr(&attr), 0);
            }
            Err(e) => {
                self.metrics.record_err();
                let ctx = OpError {
                    error: &e,
                    operation: "lookup",
                    ino: parent,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if open_flags_writable(flags) {
            self.metrics.record_err();
            reply.error(libc::EROFS);
            return;
        }
        match self.ops.open(InodeNumber(ino)) {
            Ok(handle) => {
                self.metrics.record_ok();
                reply.opened(handle.0, 0);
            }
            Err(e) => {
                self.metrics.record_err();
                let ctx = OpError {
                    error: &e,
                    operation: "open",
                    ino,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Directory listings are stateless: no handle is tracked.
        self.metrics.record_ok();
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        // Clamp negative offsets to 0 (shouldn't happen in practice).
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.ops.read_handle(HandleId(fh), byte_offset, size) {
            Ok(out) => {
                self.metrics.record_ok();
                self.metrics
                    .record_bytes_read(u64::try_from(out.bytes.len()).unwrap_or(u64::MAX));
                self.metrics.record_bytes_zeroed(out.unreadable_bytes);
                reply.data(&out.bytes);
            }
            Err(e) => {
                self.metrics.record_err();
                let ctx = OpError {
                    error: &e,
                    operation: "read",
                    ino,
                    offset: Some(byte_offset),
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.ops.release(HandleId(fh)) {
            Ok(()) => self.metrics.record_ok(),
            Err(e) => {
                // A stale handle on release is harmless; note it and move on.
                self.metrics.record_err();
                trace!(ino, fh, error = %e, "release of unknown handle");
            }
        }
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let fs_offset = u64::try_from(offset).unwrap_or(0);
        match self.ops.readdir(InodeNumber(ino), fs_offset) {
            Ok(entries) => {
                self.metrics.record_ok();
                for entry in &entries {
                    let name = OsStr::from_bytes(&entry.name);
                    let full = reply.add(
                        entry.ino.0,
                        i64::try_from(entry.offset).unwrap_or(i64::MAX),
                        to_fuse_kind(entry.kind),
                        name,
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => {
                self.metrics.record_err();
                let ctx = OpError {
                    error: &e,
                    operation: "readdir",
                    ino,
                    offset: Some(fs_offset),
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.ops.readlink(InodeNumber(ino)) {
            Ok(target) => {
                self.metrics.record_ok();
                reply.data(&target);
            }
            Err(e) => {
                self.metrics.record_err();
                let ctx = OpError {
                    error: &e,
                    operation: "readlink",
                    ino,
                    offset: None,
                };
                reply.error(ctx.log_and_errno());
            }
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let bsize = u64::from(RESCUE_BLKSIZE);
        let blocks = self.device_len.div_ceil(bsize);
        // Read-only volume: nothing free, nothing available.
        reply.statfs(blocks, 0, 0, 0, 0, RESCUE_BLKSIZE, 255, RESCUE_BLKSIZE);
    }

    // ── Mutating operations: unconditional EROFS ─────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        self.metrics.record_err();
        warn!(ino, "setattr refused: read-only rescue filesystem");
        reply.error(libc::EROFS);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        self.reply_read_only_entry("mknod", parent, reply);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        self.reply_read_only_entry("mkdir", parent, reply);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        self.reply_read_only("unlink", parent, reply);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        self.reply_read_only("rmdir", parent, reply);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        self.reply_read_only_entry("symlink", parent, reply);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        self.reply_read_only("rename", parent, reply);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        self.reply_read_only_entry("link", ino, reply);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        self.metrics.record_err();
        warn!(ino, "write refused: read-only rescue filesystem");
        reply.error(libc::EROFS);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        self.metrics.record_err();
        warn!(parent, "create refused: read-only rescue filesystem");
        reply.error(libc::EROFS);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        self.reply_read_only("setxattr", ino, reply);
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        self.reply_read_only("removexattr", ino, reply);
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        _length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        self.reply_read_only("fallocate", ino, reply);
    }
}

// ── Mount session ───────────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("rescuefs".to_owned()),
        MountOption::Subtype("rescue".to_owned()),
        MountOption::RO,
        MountOption::NoAtime,
        MountOption::DefaultPermissions,
    ];
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

enum State {
    Unmounted,
    Mounted {
        session: fuser::BackgroundSession,
        mountpoint: PathBuf,
    },
    Serving {
        mountpoint: PathBuf,
    },
}

/// FUSE-backed rescue session.
///
/// Lifecycle: `Unmounted → mount() → Mounted → serve() → Serving →
/// unmount() → Unmounted`. `serve` blocks its caller; `unmount` may be
/// invoked from any other thread (or before `serve`, in which case the
/// kernel registration is released synchronously). `unmount` on an
/// unmounted session is a no-op.
pub struct RescueSession {
    ops: Arc<RescueFs>,
    registry: Arc<MountRegistry>,
    options: MountOptions,
    state: Mutex<State>,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<AtomicMetrics>,
    device_len: u64,
}

impl RescueSession {
    #[must_use]
    pub fn new(
        index: Arc<dyn MetadataIndex>,
        reader: Arc<dyn BlockReader>,
        registry: Arc<MountRegistry>,
    ) -> Self {
        Self::with_options(index, reader, registry, &MountOptions::default())
    }

    #[must_use]
    pub fn with_options(
        index: Arc<dyn MetadataIndex>,
        reader: Arc<dyn BlockReader>,
        registry: Arc<MountRegistry>,
        options: &MountOptions,
    ) -> Self {
        let device_len = reader.len_bytes();
        Self {
            ops: Arc::new(RescueFs::new(index, reader)),
            registry,
            options: options.clone(),
            state: Mutex::new(State::Unmounted),
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(AtomicMetrics::new()),
            device_len,
        }
    }

    /// The filesystem behind this session (for direct, unmounted access).
    #[must_use]
    pub fn ops(&self) -> &Arc<RescueFs> {
        &self.ops
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        match *self.state.lock() {
            State::Unmounted => SessionPhase::Unmounted,
            State::Mounted { .. } => SessionPhase::Mounted,
            State::Serving { .. } => SessionPhase::Serving,
        }
    }

    /// Register the filesystem at `mountpoint`.
    ///
    /// Fails with `RescueError::Mount` if the target does not exist, is
    /// not a directory, is already claimed in the registry, or the kernel
    /// refuses the mount.
    pub fn mount(&self, mountpoint: &Path) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(*state, State::Unmounted) {
            return Err(RescueError::Mount("session is already mounted".to_owned()));
        }

        validate_mountpoint(mountpoint)?;
        let canonical = mountpoint.canonicalize().map_err(|e| {
            RescueError::Mount(format!("mountpoint {}: {e}", mountpoint.display()))
        })?;
        self.registry.register(&canonical)?;

        let adapter = RescueFuse {
            ops: Arc::clone(&self.ops),
            metrics: Arc::clone(&self.metrics),
            device_len: self.device_len,
        };
        let fuse_opts = build_mount_options(&self.options);
        match fuser::spawn_mount2(adapter, &canonical, &fuse_opts) {
            Ok(session) => {
                self.shutdown.store(false, Ordering::Relaxed);
                info!(mountpoint = %canonical.display(), "rescue filesystem mounted");
                *state = State::Mounted {
                    session,
                    mountpoint: canonical,
                };
                Ok(())
            }
            Err(e) => {
                self.registry.deregister(&canonical);
                Err(RescueError::Mount(format!(
                    "FUSE mount at {}: {e}",
                    canonical.display()
                )))
            }
        }
    }

    /// Dispatch until unmounted.
    ///
    /// Blocks the calling thread. Kernel requests are served by the
    /// background FUSE session; this loop holds the session alive and
    /// watches the shutdown flag, the terminal step releasing the kernel
    /// registration and the registry claim.
    pub fn serve(&self) -> Result<()> {
        let (session, mountpoint) = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Unmounted) {
                State::Mounted {
                    session,
                    mountpoint,
                } => {
                    *state = State::Serving {
                        mountpoint: mountpoint.clone(),
                    };
                    (session, mountpoint)
                }
                other => {
                    *state = other;
                    return Err(RescueError::Mount("session is not mounted".to_owned()));
                }
            }
        };

        info!(mountpoint = %mountpoint.display(), "serving rescue filesystem");
        while !self.shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(SERVE_POLL);
        }

        // Dropping the background session stops accepting new calls and
        // waits for in-flight ones before releasing the kernel mount.
        drop(session);
        let snap = self.metrics.snapshot();
        info!(
            mountpoint = %mountpoint.display(),
            requests_total = snap.requests_total,
            requests_ok = snap.requests_ok,
            requests_err = snap.requests_err,
            bytes_read = snap.bytes_read,
            bytes_zeroed = snap.bytes_zeroed,
            "rescue filesystem unmounted"
        );
        self.registry.deregister(&mountpoint);
        *self.state.lock() = State::Unmounted;
        self.shutdown.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Request graceful termination of the serve loop and release the
    /// mount registration. Idempotent: unmounting an unmounted session is
    /// a no-op.
    pub fn unmount(&self) -> Result<()> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, State::Unmounted) {
            State::Unmounted => Ok(()),
            State::Serving { mountpoint } => {
                // The serve loop owns cleanup; just signal it.
                *state = State::Serving { mountpoint };
                self.shutdown.store(true, Ordering::Relaxed);
                Ok(())
            }
            State::Mounted {
                session,
                mountpoint,
            } => {
                drop(session);
                self.registry.deregister(&mountpoint);
                info!(mountpoint = %mountpoint.display(), "rescue filesystem unmounted (never served)");
                Ok(())
            }
        }
    }
}

impl Drop for RescueSession {
    fn drop(&mut self) {
        // Best effort: release the kernel session and registry claim if
        // the owner forgot. Serving sessions are signalled, not joined.
        let _ = self.unmount();
    }
}

impl std::fmt::Debug for RescueSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RescueSession")
            .field("phase", &self.phase())
            .field("device_len", &self.device_len)
            .field("metrics", &self.metrics.snapshot())
            .finish_non_exhaustive()
    }
}
