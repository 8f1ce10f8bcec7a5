//! No-op session for platforms without FUSE.
//!
//! Satisfies the full session surface: `mount` and `serve` fail
//! deterministically with `RescueError::Unsupported`, `unmount` succeeds
//! without side effects, and the session never leaves `Unmounted`. Always
//! compiled (and tested) under its own name; exported as `RescueSession`
//! only where the native backend is unavailable.

use crate::{MetricsSnapshot, MountOptions, MountRegistry, SessionPhase};
use rfs_block::BlockReader;
use rfs_error::{RescueError, Result};
use rfs_index::MetadataIndex;
use std::path::Path;
use std::sync::Arc;

const UNSUPPORTED: &str = "FUSE mount is only supported on Linux and macOS";

/// Rescue session variant for unsupported platforms.
#[derive(Debug)]
pub struct UnsupportedSession {
    _registry: Arc<MountRegistry>,
}

impl UnsupportedSession {
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
        _index: Arc<dyn MetadataIndex>,
        _reader: Arc<dyn BlockReader>,
        registry: Arc<MountRegistry>,
        _options: &MountOptions,
    ) -> Self {
        Self {
            _registry: registry,
        }
    }

    /// Always fails: there is no serving mechanism on this platform.
    pub fn mount(&self, _mountpoint: &Path) -> Result<()> {
        Err(RescueError::Unsupported(UNSUPPORTED.to_owned()))
    }

    /// Always fails: there is nothing to serve.
    pub fn serve(&self) -> Result<()> {
        Err(RescueError::Unsupported(UNSUPPORTED.to_owned()))
    }

    /// Harmless no-op, idempotent like the native variant.
    pub fn unmount(&self) -> Result<()> {
        Ok(())
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        SessionPhase::Unmounted
    }

    /// Uniform metrics surface; always zero.
    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: 0,
            requests_ok: 0,
            requests_err: 0,
            bytes_read: 0,
            bytes_zeroed: 0,
        }
    }
}
