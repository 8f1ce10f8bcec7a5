#![forbid(unsafe_code)]
//! Raw byte access to the device or image under recovery.
//!
//! Provides the [`BlockReader`] trait (pread-style fixed-offset reads, safe
//! for concurrent invocation) plus file-backed and in-memory
//! implementations. Strictly read-only: the rescue filesystem never writes
//! to the volume it is extracting from.

use std::fs::{File, OpenOptions};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed random-access source (pread semantics).
///
/// Implementations must support concurrent `read_at` calls at arbitrary,
/// possibly overlapping offsets without interior seek state.
pub trait BlockReader: Send + Sync {
    /// Total addressable length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    ///
    /// A range extending past `len_bytes()` fails with `UnexpectedEof`.
    /// Callers that tolerate unreadable regions (the extent resolver)
    /// translate failures into zero-fill rather than propagating them.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

// ── File-backed reader ──────────────────────────────────────────────────────

/// Device/image reader using `pread`-style positioned I/O.
///
/// `std::os::unix::fs::FileExt::read_exact_at` is thread-safe and does not
/// share a seek position, so one open file serves all concurrent calls.
#[derive(Debug, Clone)]
pub struct FileReader {
    file: Arc<File>,
    len: u64,
}

impl FileReader {
    /// Open `path` read-only and capture its length.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl BlockReader for FileReader {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "positioned file reads require a unix platform",
        ))
    }
}

// ── In-memory reader ────────────────────────────────────────────────────────

/// Reader over an in-memory image.
///
/// Used by the test suites and for images small enough to load whole.
#[derive(Debug, Clone)]
pub struct MemReader {
    bytes: Arc<Vec<u8>>,
}

impl MemReader {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn from_arc(bytes: Arc<Vec<u8>>) -> Self {
        Self { bytes }
    }
}

impl BlockReader for MemReader {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.len_bytes())?;
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset exceeds usize"))?;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }
}

fn check_range(offset: u64, len: usize, total: u64) -> io::Result<()> {
    let len_u64 = u64::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "read length exceeds u64"))?;
    let end = offset
        .checked_add(len_u64)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "read range overflows u64"))?;
    if end > total {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("read out of bounds: offset={offset} len={len} total={total}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mem_reader_round_trip() {
        let reader = MemReader::new((0_u8..=255).collect());
        assert_eq!(reader.len_bytes(), 256);

        let mut buf = [0_u8; 4];
        reader.read_at(10, &mut buf).unwrap();
        assert_eq!(buf, [10, 11, 12, 13]);
    }

    #[test]
    fn mem_reader_rejects_out_of_bounds() {
        let reader = MemReader::new(vec![0_u8; 16]);
        let mut buf = [0_u8; 8];
        let err = reader.read_at(12, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        // Offset at the very end with a zero-length buffer is fine.
        reader.read_at(16, &mut []).unwrap();
    }

    #[test]
    fn mem_reader_rejects_overflowing_range() {
        let reader = MemReader::new(vec![0_u8; 16]);
        let mut buf = [0_u8; 1];
        assert!(reader.read_at(u64::MAX, &mut buf).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn file_reader_positioned_reads() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789abcdef").unwrap();
        tmp.flush().unwrap();

        let reader = FileReader::open(tmp.path()).unwrap();
        assert_eq!(reader.len_bytes(), 16);

        let mut buf = [0_u8; 6];
        reader.read_at(10, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdef");

        let err = reader.read_at(11, &mut [0_u8; 6]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[cfg(unix)]
    #[test]
    fn file_reader_missing_file_is_io_error() {
        assert!(FileReader::open("/nonexistent/rescuefs-image").is_err());
    }
}
