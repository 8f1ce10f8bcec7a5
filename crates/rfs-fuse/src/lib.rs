#![forbid(unsafe_code)]
//! Mountable rescue filesystem sessions.
//!
//! A [`RescueSession`] walks the lifecycle
//! `Unmounted → Mounted → Serving → Unmounted`: `mount` registers the
//! filesystem at a target directory, `serve` blocks dispatching kernel
//! calls until `unmount` requests graceful termination. All data calls
//! are delegated to `rfs_core::RescueFs`; every mutating call is refused
//! with `EROFS` unconditionally.
//!
//! The serving mechanism is FUSE, which exists only on Linux and macOS.
//! Other platforms get [`UnsupportedSession`] under the `RescueSession`
//! name: the identical state-machine surface, with `mount`/`serve`
//! failing deterministically (`RescueError::Unsupported`) and `unmount`
//! remaining a harmless no-op. The variant is selected by `cfg` module
//! aliasing, not by trait objects — both variants are concrete types with
//! the same inherent API.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod native;
mod null;

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use native::RescueSession;
pub use null::UnsupportedSession;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub use null::UnsupportedSession as RescueSession;

// ── Session phase ───────────────────────────────────────────────────────────

/// Externally observable lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unmounted,
    Mounted,
    Serving,
}

// ── Mount options ───────────────────────────────────────────────────────────

/// Mount-time knobs. The filesystem itself is unconditionally read-only;
/// there is no option to change that.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Allow users other than the mounter to access the filesystem.
    pub allow_other: bool,
    /// Ask the kernel to unmount automatically if the process dies
    /// without a clean unmount.
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

// ── Mount registry ──────────────────────────────────────────────────────────

/// Explicitly owned registry of active mountpoints.
///
/// The host environment demands one mount per target path; modeling the
/// uniqueness set as a value passed into each session (instead of hidden
/// static state) keeps sessions independently testable.
#[derive(Debug, Default)]
pub struct MountRegistry {
    active: Mutex<HashSet<PathBuf>>,
}

impl MountRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path`. Fails if it is already claimed.
    pub fn register(&self, path: &Path) -> rfs_error::Result<()> {
        let mut active = self.active.lock();
        if !active.insert(path.to_path_buf()) {
            return Err(rfs_error::RescueError::Mount(format!(
                "mountpoint already in use: {}",
                path.display()
            )));
        }
        Ok(())
    }

    /// Release `path`. Releasing an unclaimed path is a no-op.
    pub fn deregister(&self, path: &Path) {
        self.active.lock().remove(path);
    }

    #[must_use]
    pub fn is_registered(&self, path: &Path) -> bool {
        self.active.lock().contains(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }
}

/// Validate a mountpoint: it must exist and be a directory.
///
/// Shared by the native session (before touching the kernel) and by tests;
/// uniqueness is the registry's job, not this check's.
pub fn validate_mountpoint(path: &Path) -> rfs_error::Result<()> {
    if path.as_os_str().is_empty() {
        return Err(rfs_error::RescueError::Mount(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let meta = std::fs::metadata(path).map_err(|e| {
        rfs_error::RescueError::Mount(format!("mountpoint {}: {e}", path.display()))
    })?;
    if !meta.is_dir() {
        return Err(rfs_error::RescueError::Mount(format!(
            "mountpoint is not a directory: {}",
            path.display()
        )));
    }
    Ok(())
}

// ── Cache-line padding ──────────────────────────────────────────────────────

/// Pad a value to 64 bytes to avoid false sharing between hot counters
/// updated on different CPU cores.
#[repr(C, align(64))]
pub struct CacheLinePadded<T>(pub T);

impl<T: std::fmt::Debug> std::fmt::Debug for CacheLinePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ── Atomic metrics ──────────────────────────────────────────────────────────

/// Lock-free per-mount request counters.
///
/// Each counter sits on its own cache line so cores updating different
/// counters never invalidate each other's L1 lines.
#[repr(C)]
pub struct AtomicMetrics {
    pub requests_total: CacheLinePadded<AtomicU64>,
    pub requests_ok: CacheLinePadded<AtomicU64>,
    pub requests_err: CacheLinePadded<AtomicU64>,
    pub bytes_read: CacheLinePadded<AtomicU64>,
    /// Bytes zero-filled in place of unreadable source ranges — the
    /// partial-read indicator.
    pub bytes_zeroed: CacheLinePadded<AtomicU64>,
}

impl AtomicMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_total: CacheLinePadded(AtomicU64::new(0)),
            requests_ok: CacheLinePadded(AtomicU64::new(0)),
            requests_err: CacheLinePadded(AtomicU64::new(0)),
            bytes_read: CacheLinePadded(AtomicU64::new(0)),
            bytes_zeroed: CacheLinePadded(AtomicU64::new(0)),
        }
    }

    pub fn record_ok(&self) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_ok.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_err(&self) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_err.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_read(&self, n: u64) {
        self.bytes_read.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_bytes_zeroed(&self, n: u64) {
        self.bytes_zeroed.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot of all counters (for diagnostics / reporting).
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.0.load(Ordering::Relaxed),
            requests_ok: self.requests_ok.0.load(Ordering::Relaxed),
            requests_err: self.requests_err.0.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.0.load(Ordering::Relaxed),
            bytes_zeroed: self.bytes_zeroed.0.load(Ordering::Relaxed),
        }
    }
}

impl Default for AtomicMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AtomicMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot();
        f.debug_struct("AtomicMetrics")
            .field("requests_total", &s.requests_total)
            .field("requests_ok", &s.requests_ok)
            .field("requests_err", &s.requests_err)
            .field("bytes_read", &s.bytes_read)
            .field("bytes_zeroed", &s.bytes_zeroed)
            .finish()
    }
}

/// Point-in-time snapshot of metrics (all plain `u64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_err: u64,
    pub bytes_read: u64,
    pub bytes_zeroed: u64,
}
