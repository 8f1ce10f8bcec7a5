#![forbid(unsafe_code)]
//! Error types for rescuefs.
//!
//! # Error Taxonomy
//!
//! `RescueError` is the single user-facing error type returned by the FUSE
//! handlers, the session lifecycle, and the public API. Per-call errors
//! (`NotFound`, `NotDirectory`, …) are recovered locally: the session
//! returns them to the originating filesystem call and keeps serving.
//! `Mount` and `Unsupported` are fatal to the mount attempt and surface to
//! the caller. `Corrupt` is fatal to the serve loop.
//!
//! A read that had to zero-fill unreadable source ranges is **not** an
//! error: the call succeeds with the gaps filled and the condition is
//! reported through a warning log and the `bytes_zeroed` metric. Rescue
//! tooling prefers best-effort extraction over strict failure.
//!
//! ## FUSE errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via
//! [`RescueError::to_errno`]. The mapping is exhaustive (no wildcard arms)
//! so adding a variant is a compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw os error, else `EIO` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotSymlink` | `EINVAL` |
//! | `StaleHandle` | `EBADF` |
//! | `ReadOnly` | `EROFS` |
//! | `Mount` | `EIO` |
//! | `Unsupported` | `ENOSYS` |
//! | `Corrupt` | `EIO` |

use thiserror::Error;

/// Unified error type for all rescuefs operations.
#[derive(Debug, Error)]
pub enum RescueError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File, directory, or other named object not found in the index.
    #[error("not found: {0}")]
    NotFound(String),

    /// A lookup or listing targeted an inode that is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// readlink on an inode that is not a symlink.
    #[error("not a symlink")]
    NotSymlink,

    /// A read referenced a handle that was never opened or already released.
    #[error("stale handle: {0}")]
    StaleHandle(u64),

    /// A mutating call reached the rescue filesystem. Unconditional policy:
    /// the view is strictly read-only.
    #[error("read-only filesystem")]
    ReadOnly,

    /// Mount-time failure: bad mountpoint, duplicate registration, or a
    /// FUSE setup error.
    #[error("mount failed: {0}")]
    Mount(String),

    /// FUSE serving is not available on this platform.
    #[error("unsupported platform: {0}")]
    Unsupported(String),

    /// Index corruption severe enough that serving cannot continue.
    #[error("corrupt index: {0}")]
    Corrupt(String),
}

impl RescueError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm.
    ///
    /// Policy notes:
    /// - `NotSymlink` → `EINVAL`: matches the kernel's reply for
    ///   readlink(2) on a non-link.
    /// - `StaleHandle` → `EBADF`: the handle id is not (or no longer) a
    ///   valid open file description.
    /// - `Unsupported` → `ENOSYS`: the serving mechanism itself is absent.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotSymlink => libc::EINVAL,
            Self::StaleHandle(_) => libc::EBADF,
            Self::ReadOnly => libc::EROFS,
            Self::Mount(_) | Self::Corrupt(_) => libc::EIO,
            Self::Unsupported(_) => libc::ENOSYS,
        }
    }
}

/// Result alias using `RescueError`.
pub type Result<T> = std::result::Result<T, RescueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(RescueError, libc::c_int)> = vec![
            (RescueError::Io(std::io::Error::other("test")), libc::EIO),
            (RescueError::NotFound("missing.txt".into()), libc::ENOENT),
            (RescueError::NotDirectory, libc::ENOTDIR),
            (RescueError::IsDirectory, libc::EISDIR),
            (RescueError::NotSymlink, libc::EINVAL),
            (RescueError::StaleHandle(7), libc::EBADF),
            (RescueError::ReadOnly, libc::EROFS),
            (RescueError::Mount("target missing".into()), libc::EIO),
            (RescueError::Unsupported("no FUSE".into()), libc::ENOSYS),
            (RescueError::Corrupt("cyclic directory graph".into()), libc::EIO),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EACCES);
        let err = RescueError::Io(raw);
        assert_eq!(err.to_errno(), libc::EACCES);
    }

    #[test]
    fn display_formatting() {
        assert_eq!(
            RescueError::NotFound("missing.txt".into()).to_string(),
            "not found: missing.txt"
        );
        assert_eq!(RescueError::ReadOnly.to_string(), "read-only filesystem");
        assert_eq!(
            RescueError::StaleHandle(42).to_string(),
            "stale handle: 42"
        );
        assert!(
            RescueError::Unsupported("FUSE mount is only supported on Linux and macOS".into())
                .to_string()
                .contains("unsupported platform")
        );
    }
}
