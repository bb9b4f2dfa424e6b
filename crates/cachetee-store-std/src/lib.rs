use std::env;
use std::fs::{File, OpenOptions, create_dir_all};
use std::path::{Path, PathBuf};

use cachetee::CacheOps;
use cachetee_core::{TeeError, TeeErrorKind, TeeResult};
use tracing::debug;

#[cfg(target_family = "unix")]
use std::os::unix::fs::FileExt;
#[cfg(target_family = "windows")]
use std::os::windows::fs::FileExt;

mod directory;
mod reader;

pub use directory::{NativeDirectory, StdCacheTeeFile, cache_file_name};
pub use reader::StdFileReader;

/// Environment variable naming the cache directory, checked before the XDG locations.
pub const CACHE_DIR_ENV: &str = "CACHETEE_DIR";

/// Standard filesystem-backed cache file implementation.
///
/// All I/O is positional, so concurrent readers do not serialize on a shared cursor.
pub struct StdCacheOps {
    path: PathBuf,
    file: File,
}

impl StdCacheOps {
    /// Open or create a cache file at an explicit path.
    pub fn open_path(path: impl AsRef<Path>) -> TeeResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            create_dir_all(parent).map_err(map_io_err("create cache directory"))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(map_io_err("open cache file"))?;
        debug!(cache_path = %path.display(), "opened std cache file");
        Ok(Self { path, file })
    }

    /// Open an existing cache file without creating it, for read-only inspection.
    pub fn open_existing(path: impl AsRef<Path>) -> TeeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(map_io_err("open cache file"))?;
        Ok(Self { path, file })
    }

    /// Full path to the underlying cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheOps for StdCacheOps {
    fn read_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        read_file_at(&self.file, out, offset).map_err(map_io_err("read cache file"))
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> TeeResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        write_file_all_at(&self.file, data, offset).map_err(map_io_err("write cache file"))
    }

    fn set_len(&self, len: u64) -> TeeResult<()> {
        self.file
            .set_len(len)
            .map_err(map_io_err("resize cache file"))
    }

    fn flush(&self) -> TeeResult<()> {
        self.file
            .sync_data()
            .map_err(map_io_err("flush cache file"))
    }
}

/// Cache directory used when the caller does not name one.
pub fn default_cache_root() -> TeeResult<PathBuf> {
    if let Some(path) = env::var_os(CACHE_DIR_ENV) {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    if let Some(path) = env::var_os("XDG_CACHE_HOME") {
        if !path.is_empty() {
            return Ok(PathBuf::from(path).join("cachetee"));
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Some(path) = env::var_os("LOCALAPPDATA") {
            if !path.is_empty() {
                return Ok(PathBuf::from(path).join("cachetee"));
            }
        }
    }

    if let Some(path) = env::var_os("HOME") {
        if !path.is_empty() {
            return Ok(PathBuf::from(path).join(".cache").join("cachetee"));
        }
    }

    Err(TeeError::with_message(
        TeeErrorKind::InvalidInput,
        format!("unable to determine cache root (set {CACHE_DIR_ENV} or XDG_CACHE_HOME)"),
    ))
}

#[cfg(target_family = "unix")]
pub(crate) fn read_file_at(file: &File, out: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.read_at(out, offset)
}

#[cfg(target_family = "windows")]
pub(crate) fn read_file_at(file: &File, out: &mut [u8], offset: u64) -> std::io::Result<usize> {
    file.seek_read(out, offset)
}

#[cfg(not(any(target_family = "unix", target_family = "windows")))]
pub(crate) fn read_file_at(_file: &File, _out: &mut [u8], _offset: u64) -> std::io::Result<usize> {
    Err(std::io::Error::other(
        "positional file reads are unsupported on this target",
    ))
}

#[cfg(target_family = "unix")]
fn write_file_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    file.write_at(data, offset)
}

#[cfg(target_family = "windows")]
fn write_file_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<usize> {
    file.seek_write(data, offset)
}

#[cfg(not(any(target_family = "unix", target_family = "windows")))]
fn write_file_at(_file: &File, _data: &[u8], _offset: u64) -> std::io::Result<usize> {
    Err(std::io::Error::other(
        "positional file writes are unsupported on this target",
    ))
}

fn write_file_all_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    let mut written = 0usize;
    while written < data.len() {
        let at = offset
            .checked_add(written as u64)
            .ok_or_else(|| std::io::Error::other("write offset overflow"))?;
        let count = match write_file_at(file, &data[written..], at) {
            Ok(count) => count,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if count == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write cache file",
            ));
        }
        written += count;
    }
    Ok(())
}

pub(crate) fn map_io_err(op: &'static str) -> impl FnOnce(std::io::Error) -> TeeError {
    move |err| TeeError::with_message(TeeErrorKind::Io, format!("{op}: {err}"))
}
