use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use cachetee::{CacheTeeConfig, CacheTeeFile};
use cachetee_core::{FileReader, TeeError, TeeErrorKind, TeeResult};
use tracing::debug;

use crate::{StdCacheOps, StdFileReader, map_io_err};

const SIDECAR_SUFFIX: &str = ".wm_cache";

pub type StdCacheTeeFile = CacheTeeFile<StdCacheOps>;

/// Sidecar file name for a backing file name.
pub fn cache_file_name(backing_name: &str) -> String {
    format!("{backing_name}{SIDECAR_SUFFIX}")
}

/// Native directory that opens backing files and wraps them in cache tees.
///
/// Relative paths resolve against `root`. Each sidecar path has at most one live
/// [`StdCacheTeeFile`]; asking for it again while a handle is alive returns that handle instead of
/// opening a second writer on the same file. Entries disappear when the last handle is dropped.
pub struct NativeDirectory {
    root: PathBuf,
    sidecars: Mutex<HashMap<PathBuf, Weak<StdCacheTeeFile>>>,
}

impl NativeDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sidecars: Mutex::new(HashMap::new()),
        }
    }

    /// Directory rooted at the process working directory.
    pub fn current() -> TeeResult<Self> {
        let root = env::current_dir().map_err(map_io_err("resolve working directory"))?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join(path)
    }

    pub fn open_file_read(&self, path: impl AsRef<Path>) -> TeeResult<Arc<StdFileReader>> {
        StdFileReader::open(self.resolve(path)).map(Arc::new)
    }

    /// Where the sidecar for `backing_name` lives under `cache_dir`.
    pub fn sidecar_path(&self, backing_name: &str, cache_dir: impl AsRef<Path>) -> PathBuf {
        self.resolve(cache_dir).join(cache_file_name(backing_name))
    }

    /// Open the file at `backing_path` and wrap it in a cache tee whose sidecar lives in
    /// `cache_dir`. A `block_size` of zero selects the default.
    pub fn make_cache_tee(
        &self,
        backing_path: impl AsRef<Path>,
        block_size: u32,
        cache_dir: impl AsRef<Path>,
    ) -> TeeResult<Arc<StdCacheTeeFile>> {
        let source = self.open_file_read(backing_path)?;
        let name = source.file_name().map(str::to_owned).ok_or_else(|| {
            TeeError::with_message(
                TeeErrorKind::InvalidInput,
                format!("backing path {} has no file name", source.path().display()),
            )
        })?;
        self.make_cache_tee_for(
            source,
            &name,
            CacheTeeConfig::with_block_size(block_size),
            cache_dir,
        )
    }

    /// Wrap an already opened backing file, naming its sidecar after `backing_name`.
    pub fn make_cache_tee_for(
        &self,
        source: Arc<dyn FileReader>,
        backing_name: &str,
        config: CacheTeeConfig,
        cache_dir: impl AsRef<Path>,
    ) -> TeeResult<Arc<StdCacheTeeFile>> {
        if backing_name.is_empty() || backing_name.contains(['/', '\\']) {
            return Err(TeeError::with_message(
                TeeErrorKind::InvalidInput,
                format!("invalid backing file name {backing_name:?}"),
            ));
        }
        let sidecar = self.sidecar_path(backing_name, cache_dir);
        let mut sidecars = self.lock_sidecars()?;
        sidecars.retain(|_, tee| tee.strong_count() > 0);

        if let Some(live) = sidecars.get(&sidecar).and_then(Weak::upgrade) {
            if live.block_size() != config.effective_block_size() {
                return Err(TeeError::with_message(
                    TeeErrorKind::InvalidInput,
                    format!(
                        "sidecar {} already open with block size {}",
                        sidecar.display(),
                        live.block_size()
                    ),
                ));
            }
            debug!(sidecar = %sidecar.display(), "sharing live cache tee");
            return Ok(live);
        }

        let ops = StdCacheOps::open_path(&sidecar)?;
        let tee = Arc::new(CacheTeeFile::open(source, ops, config)?);
        sidecars.insert(sidecar.clone(), Arc::downgrade(&tee));
        debug!(
            sidecar = %sidecar.display(),
            live_sidecars = sidecars.len(),
            "cache tee registered"
        );
        Ok(tee)
    }

    /// Number of sidecars with a live handle.
    pub fn open_sidecars(&self) -> TeeResult<usize> {
        let mut sidecars = self.lock_sidecars()?;
        sidecars.retain(|_, tee| tee.strong_count() > 0);
        Ok(sidecars.len())
    }

    fn lock_sidecars(&self) -> TeeResult<MutexGuard<'_, HashMap<PathBuf, Weak<StdCacheTeeFile>>>> {
        self.sidecars.lock().map_err(|_| {
            TeeError::with_message(TeeErrorKind::Io, "sidecar registry lock poisoned")
        })
    }
}
