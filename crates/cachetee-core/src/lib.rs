use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub mod memory;

pub use memory::MemoryFileReader;

/// Broad classification of a [`TeeError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TeeErrorKind {
    /// The backing source failed to deliver bytes. The only kind a cached read surfaces.
    SourceRead,
    /// Reading previously cached bytes back from the cache file failed.
    CacheRead,
    /// Persisting fetched bytes or metadata into the cache file failed.
    CacheWrite,
    /// The cache file header or bitmap is malformed or describes another file.
    InvalidCacheFormat,
    /// A caller broke an API contract (unset block read, misaligned block write).
    PreconditionViolation,
    InvalidInput,
    OutOfRange,
    Io,
}

impl TeeErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceRead => "source read",
            Self::CacheRead => "cache read",
            Self::CacheWrite => "cache write",
            Self::InvalidCacheFormat => "invalid cache format",
            Self::PreconditionViolation => "precondition violation",
            Self::InvalidInput => "invalid input",
            Self::OutOfRange => "out of range",
            Self::Io => "i/o",
        }
    }
}

impl fmt::Display for TeeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error)]
#[error("{kind}: {message}")]
pub struct TeeError {
    kind: TeeErrorKind,
    message: String,
}

impl TeeError {
    pub fn new(kind: TeeErrorKind) -> Self {
        Self {
            kind,
            message: String::from(kind.as_str()),
        }
    }

    pub fn with_message(kind: TeeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> TeeErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Re-tag an error raised by a collaborator, keeping its message as context.
    pub fn reclassify(self, kind: TeeErrorKind, context: &str) -> Self {
        Self::with_message(kind, format!("{context}: {}", self.message))
    }
}

pub type TeeResult<T> = Result<T, TeeError>;

/// Read-only random-access file.
///
/// Implementations must tolerate concurrent `read_at` calls from multiple threads. A read returns
/// fewer bytes than requested only when the range runs past the end of the file.
pub trait FileReader: Send + Sync {
    /// Total length of the file in bytes.
    fn size(&self) -> TeeResult<u64>;

    /// Read bytes starting at `offset`. Returns the number of bytes read; zero at or past EOF.
    fn read_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<usize>;

    /// Write a stable, human-readable name for this file.
    fn write_identity(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}

impl<T> FileReader for Arc<T>
where
    T: FileReader + ?Sized,
{
    fn size(&self) -> TeeResult<u64> {
        (**self).size()
    }

    fn read_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<usize> {
        (**self).read_at(offset, out)
    }

    fn write_identity(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        (**self).write_identity(out)
    }
}

impl<T> FileReader for Box<T>
where
    T: FileReader + ?Sized,
{
    fn size(&self) -> TeeResult<u64> {
        (**self).size()
    }

    fn read_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<usize> {
        (**self).read_at(offset, out)
    }

    fn write_identity(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        (**self).write_identity(out)
    }
}

pub fn identity_string<R: FileReader + ?Sized>(reader: &R) -> String {
    let mut identity = String::new();
    let _ = reader.write_identity(&mut identity);
    identity
}

/// Keep calling `read_at` until `out` is full or the reader reports EOF.
///
/// Returns the number of bytes filled, which is short only at end of file.
pub fn read_full_at<R: FileReader + ?Sized>(
    reader: &R,
    mut offset: u64,
    out: &mut [u8],
) -> TeeResult<usize> {
    let mut filled = 0usize;
    while filled < out.len() {
        let read = reader.read_at(offset, &mut out[filled..])?;
        if read == 0 {
            break;
        }
        if read > out.len() - filled {
            return Err(TeeError::with_message(
                TeeErrorKind::Io,
                "reader returned more bytes than requested",
            ));
        }
        filled += read;
        offset = offset.checked_add(read as u64).ok_or_else(|| {
            TeeError::with_message(TeeErrorKind::OutOfRange, "read offset overflow")
        })?;
    }
    Ok(filled)
}
