use std::sync::Arc;

use cachetee_core::{TeeError, TeeErrorKind, TeeResult};
use parking_lot::Mutex;

/// Backend I/O abstraction for a single cache file.
///
/// Implementations are expected to be internally synchronized; the cache may call these
/// methods concurrently from multiple threads.
pub trait CacheOps: Send + Sync {
    /// Read bytes at a fixed offset. Returns the number of bytes read.
    fn read_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<usize>;

    /// Write all bytes at a fixed offset.
    fn write_at(&self, offset: u64, data: &[u8]) -> TeeResult<()>;

    /// Resize the underlying cache file.
    fn set_len(&self, len: u64) -> TeeResult<()>;

    /// Persist pending data and metadata changes.
    fn flush(&self) -> TeeResult<()>;
}

impl<T> CacheOps for Arc<T>
where
    T: CacheOps + ?Sized,
{
    fn read_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<usize> {
        (**self).read_at(offset, out)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> TeeResult<()> {
        (**self).write_at(offset, data)
    }

    fn set_len(&self, len: u64) -> TeeResult<()> {
        (**self).set_len(len)
    }

    fn flush(&self) -> TeeResult<()> {
        (**self).flush()
    }
}

/// In-memory cache file implementation useful for tests and embedded callers.
pub struct MemoryCacheOps {
    state: Mutex<Vec<u8>>,
}

impl MemoryCacheOps {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Vec::new()),
        }
    }

    /// Copy of the current file contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().clone()
    }

    /// Replace the file contents wholesale.
    pub fn replace(&self, contents: Vec<u8>) {
        *self.state.lock() = contents;
    }
}

impl Default for MemoryCacheOps {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheOps for MemoryCacheOps {
    fn read_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let guard = self.state.lock();
        let start = match usize::try_from(offset) {
            Ok(v) => v,
            Err(_) => return Ok(0),
        };
        if start >= guard.len() {
            return Ok(0);
        }
        let available = guard.len() - start;
        let copy_len = available.min(out.len());
        out[..copy_len].copy_from_slice(&guard[start..start + copy_len]);
        Ok(copy_len)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> TeeResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut guard = self.state.lock();
        let start = usize::try_from(offset).map_err(|_| {
            TeeError::with_message(TeeErrorKind::OutOfRange, "offset exceeds memory cache")
        })?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| TeeError::with_message(TeeErrorKind::OutOfRange, "write overflow"))?;
        if end > guard.len() {
            guard.resize(end, 0);
        }
        guard[start..end].copy_from_slice(data);
        Ok(())
    }

    fn set_len(&self, len: u64) -> TeeResult<()> {
        let len = usize::try_from(len).map_err(|_| {
            TeeError::with_message(TeeErrorKind::OutOfRange, "length exceeds memory cache")
        })?;
        self.state.lock().resize(len, 0);
        Ok(())
    }

    fn flush(&self) -> TeeResult<()> {
        Ok(())
    }
}

/// Fill `out` from the cache file. Returns `false` if the file ended first.
pub(crate) fn read_exact_at<C: CacheOps + ?Sized>(
    cache: &C,
    offset: u64,
    out: &mut [u8],
) -> TeeResult<bool> {
    Ok(read_prefix_at(cache, offset, out)? == out.len())
}

/// Read into `out` until it is full or the cache file ends. Returns the bytes filled.
pub(crate) fn read_prefix_at<C: CacheOps + ?Sized>(
    cache: &C,
    mut offset: u64,
    out: &mut [u8],
) -> TeeResult<usize> {
    let mut filled = 0usize;
    while filled < out.len() {
        let read = cache.read_at(offset, &mut out[filled..])?;
        if read == 0 {
            break;
        }
        filled = filled.checked_add(read).ok_or_else(|| {
            TeeError::with_message(TeeErrorKind::OutOfRange, "read size overflow")
        })?;
        offset = offset.checked_add(read as u64).ok_or_else(|| {
            TeeError::with_message(TeeErrorKind::OutOfRange, "read offset overflow")
        })?;
    }
    Ok(filled)
}

const ZERO_CHUNK_LEN: usize = 4096;

pub(crate) fn write_zero_region<C: CacheOps + ?Sized>(
    cache: &C,
    mut offset: u64,
    len: u64,
) -> TeeResult<()> {
    let mut remaining = len;
    let zero = [0u8; ZERO_CHUNK_LEN];
    while remaining > 0 {
        let write_len = remaining.min(ZERO_CHUNK_LEN as u64) as usize;
        cache.write_at(offset, &zero[..write_len])?;
        offset = offset.checked_add(write_len as u64).ok_or_else(|| {
            TeeError::with_message(TeeErrorKind::OutOfRange, "zero-fill offset overflow")
        })?;
        remaining -= write_len as u64;
    }
    Ok(())
}
