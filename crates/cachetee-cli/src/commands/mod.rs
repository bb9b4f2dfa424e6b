use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use cachetee::{CacheTeeConfig, DEFAULT_BLOCK_SIZE, DEFAULT_FLUSH_BLOCKS, DEFAULT_MAX_FETCH_BLOCKS};
use cachetee_store_std::{CACHE_DIR_ENV, NativeDirectory, StdCacheTeeFile, default_cache_root};
use clap::Args;
use tracing::{debug, info};

mod inspect;
mod read;
mod warm;

pub use inspect::{InspectArgs, run_inspect};
pub use read::{ReadArgs, run_read};
pub use warm::{WarmArgs, run_warm};

/// Options shared by every command that opens a cache tee.
#[derive(Args, Debug)]
pub struct CacheArgs {
    /// Directory holding cache sidecars.
    #[arg(long, value_name = "DIR", env = CACHE_DIR_ENV)]
    pub cache_dir: Option<PathBuf>,
    /// Caching granularity in bytes.
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: u32,
    /// Newly cached blocks between bitmap flushes.
    #[arg(long, default_value_t = DEFAULT_FLUSH_BLOCKS)]
    pub flush_every: u32,
    /// Largest single backing fetch, in blocks.
    #[arg(long, default_value_t = DEFAULT_MAX_FETCH_BLOCKS)]
    pub max_fetch_blocks: u64,
}

impl CacheArgs {
    fn config(&self) -> CacheTeeConfig {
        CacheTeeConfig {
            block_size: self.block_size,
            flush_every_blocks: self.flush_every,
            max_fetch_blocks: self.max_fetch_blocks,
        }
    }

    fn resolve_cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_cache_root().context("resolving default cache directory"),
        }
    }
}

pub(crate) fn open_cache_tee(backing: &Path, cache: &CacheArgs) -> Result<Arc<StdCacheTeeFile>> {
    let directory = NativeDirectory::current().context("resolving working directory")?;
    let source = directory
        .open_file_read(backing)
        .with_context(|| format!("opening backing file {}", backing.display()))?;
    let name = source
        .file_name()
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("backing path {} has no file name", backing.display()))?;
    let cache_dir = cache.resolve_cache_dir()?;
    debug!(
        backing = %source.path().display(),
        cache_dir = %cache_dir.display(),
        "opening cache tee"
    );

    let tee = directory
        .make_cache_tee_for(source, &name, cache.config(), &cache_dir)
        .with_context(|| format!("opening cache sidecar for {}", backing.display()))?;
    info!(
        sidecar = %directory.sidecar_path(&name, &cache_dir).display(),
        reused = tee.store().reused(),
        cached_blocks = tee.completeness().cached_blocks,
        total_blocks = tee.completeness().total_blocks,
        "cache tee ready"
    );
    Ok(tee)
}

/// Clip `offset..offset+length` to a file of `file_size` bytes; `None` means "to the end".
pub(crate) fn resolve_range(
    file_size: u64,
    offset: u64,
    length: Option<u64>,
) -> Result<(u64, u64)> {
    if offset > file_size {
        bail!("offset {offset} is past the end of the file ({file_size} bytes)");
    }
    let available = file_size - offset;
    let len = length.map_or(available, |len| len.min(available));
    Ok((offset, len))
}
