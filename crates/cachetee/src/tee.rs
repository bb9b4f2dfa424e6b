use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cachetee_core::{FileReader, TeeError, TeeErrorKind, TeeResult, identity_string, read_full_at};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::ops::CacheOps;
use crate::store::{CacheStore, Completeness, DEFAULT_FLUSH_BLOCKS};

pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;
pub const DEFAULT_MAX_FETCH_BLOCKS: u64 = 1024;
const STATS_LOG_INTERVAL: u64 = 1000;

/// Tuning knobs for a [`CacheTeeFile`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheTeeConfig {
    /// Caching granularity in bytes. Zero selects [`DEFAULT_BLOCK_SIZE`].
    pub block_size: u32,

    /// Newly cached blocks between automatic bitmap flushes.
    pub flush_every_blocks: u32,

    /// Upper bound on a single coalesced backing fetch, in blocks.
    pub max_fetch_blocks: u64,
}

impl Default for CacheTeeConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            flush_every_blocks: DEFAULT_FLUSH_BLOCKS,
            max_fetch_blocks: DEFAULT_MAX_FETCH_BLOCKS,
        }
    }
}

impl CacheTeeConfig {
    pub fn with_block_size(block_size: u32) -> Self {
        Self {
            block_size,
            ..Self::default()
        }
    }

    pub fn effective_block_size(&self) -> u32 {
        if self.block_size == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            self.block_size
        }
    }

    fn validate(&self) -> TeeResult<()> {
        if self.flush_every_blocks == 0 {
            return Err(TeeError::with_message(
                TeeErrorKind::InvalidInput,
                "flush block limit must be non-zero",
            ));
        }
        if self.max_fetch_blocks == 0 {
            return Err(TeeError::with_message(
                TeeErrorKind::InvalidInput,
                "max fetch blocks must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Snapshot of cache behavior and population.
#[derive(Clone, Copy, Debug)]
pub struct CacheStats {
    /// Blocks served from the cache file.
    pub total_hits: u64,
    /// Blocks that had to come from the backing source.
    pub total_misses: u64,
    /// Reads issued against the backing source.
    pub source_fetches: u64,
    /// Cache reads or writes that failed and were absorbed.
    pub cache_failures: u64,
    pub cached_blocks: u64,
    pub total_blocks: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_hits + self.total_misses;
        if total == 0 {
            return 0.0;
        }
        (self.total_hits as f64 / total as f64) * 100.0
    }

    pub fn fill_rate(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        (self.cached_blocks as f64 / self.total_blocks as f64) * 100.0
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    source_fetches: AtomicU64,
    cache_failures: AtomicU64,
}

/// Blocks currently being fetched by some thread.
struct InFlight {
    blocks: BTreeSet<u64>,
}

enum Claim {
    /// Another thread cached these blocks while we waited; serve them from the store.
    Cached(u64),
    /// These blocks are ours to fetch.
    Owned(u64),
}

/// Releases claimed blocks and wakes waiters on every exit path.
struct ClaimGuard<'a> {
    in_flight: &'a Mutex<InFlight>,
    released: &'a Condvar,
    start: u64,
    count: u64,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        let mut guard = self.in_flight.lock();
        for block in self.start..self.start + self.count {
            guard.blocks.remove(&block);
        }
        drop(guard);
        self.released.notify_all();
    }
}

/// Read-only file wrapper that tees backing reads into a persistent block cache.
///
/// Each read is split into runs of cached and uncached blocks. Cached runs are served from the
/// cache file with one read each; uncached runs are fetched from the backing source with one read
/// each, handed to the caller, then written into the cache. Failures of the cache itself never
/// reach the caller: the affected blocks simply stay uncached and are fetched again next time.
pub struct CacheTeeFile<C>
where
    C: CacheOps,
{
    source: Arc<dyn FileReader>,
    store: CacheStore<C>,
    identity: String,
    file_size: u64,
    block_size: u32,
    max_fetch_blocks: u64,
    in_flight: Mutex<InFlight>,
    released: Condvar,
    counters: Counters,
}

impl<C> CacheTeeFile<C>
where
    C: CacheOps,
{
    /// Wrap `source`, opening or initializing the cache held by `cache`.
    ///
    /// The backing size is read once here and assumed constant afterwards.
    pub fn open(source: Arc<dyn FileReader>, cache: C, config: CacheTeeConfig) -> TeeResult<Self> {
        config.validate()?;
        let block_size = config.effective_block_size();
        let file_size = source
            .size()
            .map_err(|err| err.reclassify(TeeErrorKind::SourceRead, "query backing size"))?;
        let store = CacheStore::open(cache, file_size, block_size, config.flush_every_blocks)?;
        let identity = identity_string(&*source);
        let completeness = store.completeness();
        debug!(
            source = %identity,
            block_size,
            file_size,
            cached_blocks = completeness.cached_blocks,
            total_blocks = completeness.total_blocks,
            reused = store.reused(),
            max_fetch_blocks = config.max_fetch_blocks,
            "cache tee file opened"
        );
        Ok(Self {
            source,
            store,
            identity,
            file_size,
            block_size,
            max_fetch_blocks: config.max_fetch_blocks,
            in_flight: Mutex::new(InFlight {
                blocks: BTreeSet::new(),
            }),
            released: Condvar::new(),
            counters: Counters::default(),
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn store(&self) -> &CacheStore<C> {
        &self.store
    }

    pub fn source(&self) -> &Arc<dyn FileReader> {
        &self.source
    }

    pub fn completeness(&self) -> Completeness {
        self.store.completeness()
    }

    pub fn is_complete(&self) -> bool {
        self.completeness().is_complete()
    }

    pub fn stats(&self) -> CacheStats {
        let completeness = self.store.completeness();
        CacheStats {
            total_hits: self.counters.hits.load(Ordering::Relaxed),
            total_misses: self.counters.misses.load(Ordering::Relaxed),
            source_fetches: self.counters.source_fetches.load(Ordering::Relaxed),
            cache_failures: self.counters.cache_failures.load(Ordering::Relaxed),
            cached_blocks: completeness.cached_blocks,
            total_blocks: completeness.total_blocks,
        }
    }

    /// Persist pending bitmap updates now.
    pub fn flush(&self) -> TeeResult<()> {
        self.store.flush()
    }

    /// Flush pending state. Dropping the last reference does the same, logging failures.
    pub fn close(&self) -> TeeResult<()> {
        self.store.close()
    }

    /// Read up to `out.len()` bytes at `offset`.
    ///
    /// Returns fewer bytes only when the range runs past end of file, and zero at or past it.
    /// Only backing-source failures are reported.
    pub fn read_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<usize> {
        let Some(len) = self.clip(offset, out.len()) else {
            return Ok(0);
        };
        self.route(offset, len, Some(&mut out[..len]))?;
        Ok(len)
    }

    pub fn read_vec_at(&self, offset: u64, len: usize) -> TeeResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        let read = self.read_at(offset, &mut out)?;
        out.truncate(read);
        Ok(out)
    }

    /// Fill `out` completely, failing with [`TeeErrorKind::OutOfRange`] if it crosses EOF.
    pub fn read_exact_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<()> {
        let read = self.read_at(offset, out)?;
        if read != out.len() {
            return Err(TeeError::with_message(
                TeeErrorKind::OutOfRange,
                format!(
                    "read of {} bytes at {offset} crosses end of file at {}",
                    out.len(),
                    self.file_size
                ),
            ));
        }
        Ok(())
    }

    /// Make sure the blocks covering `[offset, offset + len)` are cached, without copying out.
    ///
    /// Blocks whose cache write fails stay uncached; check [`Self::completeness`] afterwards.
    pub fn ensure_cached(&self, offset: u64, len: u64) -> TeeResult<()> {
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        let Some(len) = self.clip(offset, len) else {
            return Ok(());
        };
        self.route(offset, len, None)
    }

    fn clip(&self, offset: u64, len: usize) -> Option<usize> {
        if len == 0 || offset >= self.file_size {
            return None;
        }
        let available = self.file_size - offset;
        Some(usize::try_from(available).map_or(len, |available| available.min(len)))
    }

    fn route(&self, offset: u64, len: usize, mut out: Option<&mut [u8]>) -> TeeResult<()> {
        let layout = self.store.layout();
        let end = offset + len as u64;
        let first = layout.block_of(offset);
        let last = layout.block_of(end - 1);

        let mut block = first;
        while block <= last {
            let (hit, run) = self.store.next_run(block, last + 1);
            if hit {
                trace!(offset, len, start_block = block, blocks = run, "cache hit run");
                self.counters.hits.fetch_add(run, Ordering::Relaxed);
                if let Some(out) = out.as_deref_mut() {
                    self.serve_cached(block, run, offset, out)?;
                }
            } else {
                trace!(offset, len, start_block = block, blocks = run, "cache miss run");
                self.serve_missing(block, run, offset, out.as_deref_mut())?;
            }
            block += run;
        }

        self.maybe_log_stats(last - first + 1);
        Ok(())
    }

    fn serve_cached(
        &self,
        start: u64,
        count: u64,
        req_offset: u64,
        out: &mut [u8],
    ) -> TeeResult<()> {
        let (run_offset, run_len) = self.store.layout().span(start, count);
        let req_end = req_offset + out.len() as u64;
        let result = if run_offset >= req_offset && run_offset + run_len as u64 <= req_end {
            let dst = (run_offset - req_offset) as usize;
            self.store
                .read_blocks(start, count, &mut out[dst..dst + run_len])
        } else {
            let mut scratch = vec![0u8; run_len];
            self.store
                .read_blocks(start, count, &mut scratch)
                .map(|()| copy_overlap(run_offset, &scratch, req_offset, out))
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.counters.cache_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    source = %self.identity,
                    start_block = start,
                    blocks = count,
                    error = %err,
                    "cache read failed; serving run from backing source"
                );
                let end = start + count;
                let mut block = start;
                while block < end {
                    let chunk = (end - block).min(self.max_fetch_blocks);
                    let (chunk_offset, _) = self.store.layout().span(block, chunk);
                    let data = self.fetch_source(block, chunk)?;
                    copy_overlap(chunk_offset, &data, req_offset, out);
                    block += chunk;
                }
                Ok(())
            }
        }
    }

    fn serve_missing(
        &self,
        start: u64,
        count: u64,
        req_offset: u64,
        mut out: Option<&mut [u8]>,
    ) -> TeeResult<()> {
        let end = start + count;
        let mut block = start;
        while block < end {
            match self.claim(block, end) {
                Claim::Cached(run) => {
                    trace!(start_block = block, blocks = run, "blocks cached by another reader");
                    self.counters.hits.fetch_add(run, Ordering::Relaxed);
                    if let Some(out) = out.as_deref_mut() {
                        self.serve_cached(block, run, req_offset, out)?;
                    }
                    block += run;
                }
                Claim::Owned(run) => {
                    self.counters.misses.fetch_add(run, Ordering::Relaxed);
                    let _claim = ClaimGuard {
                        in_flight: &self.in_flight,
                        released: &self.released,
                        start: block,
                        count: run,
                    };
                    let data = self.fetch_source(block, run)?;
                    if let Some(out) = out.as_deref_mut() {
                        let (run_offset, _) = self.store.layout().span(block, run);
                        copy_overlap(run_offset, &data, req_offset, out);
                    }
                    self.populate(block, run, &data);
                    block += run;
                }
            }
        }
        Ok(())
    }

    /// Claim the longest fetchable run starting at `block`, waiting out other fetchers first.
    ///
    /// The bitmap is consulted only after the in-flight lock is held and `block` is unclaimed,
    /// so a block finished by another thread while we waited is seen as cached.
    fn claim(&self, block: u64, end: u64) -> Claim {
        let mut guard = self.in_flight.lock();
        while guard.blocks.contains(&block) {
            trace!(block, "waiting for in-flight fetch");
            self.released.wait(&mut guard);
        }

        let (hit, run) = self.store.next_run(block, end);
        if hit {
            return Claim::Cached(run);
        }
        let limit = run.min(self.max_fetch_blocks);
        let mut owned = 0u64;
        while owned < limit && !guard.blocks.contains(&(block + owned)) {
            guard.blocks.insert(block + owned);
            owned += 1;
        }
        trace!(
            start_block = block,
            blocks = owned,
            in_flight = guard.blocks.len(),
            "claimed blocks for fetch"
        );
        Claim::Owned(owned)
    }

    fn fetch_source(&self, start: u64, count: u64) -> TeeResult<Vec<u8>> {
        let (offset, len) = self.store.layout().span(start, count);
        let mut buf = vec![0u8; len];
        let read = read_full_at(&*self.source, offset, &mut buf).map_err(|err| {
            err.reclassify(
                TeeErrorKind::SourceRead,
                &format!("read {len} bytes at {offset} from {}", self.identity),
            )
        })?;
        self.counters.source_fetches.fetch_add(1, Ordering::Relaxed);
        if read != len {
            return Err(TeeError::with_message(
                TeeErrorKind::SourceRead,
                format!(
                    "backing source returned {read} of {len} bytes at {offset}; file shrank below {}",
                    self.file_size
                ),
            ));
        }
        trace!(
            offset,
            len,
            start_block = start,
            blocks = count,
            "fetched from backing source"
        );
        Ok(buf)
    }

    fn populate(&self, start: u64, count: u64, data: &[u8]) {
        if let Err(err) = self.store.write_blocks(start, count, data) {
            self.counters.cache_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                source = %self.identity,
                start_block = start,
                blocks = count,
                error = %err,
                "failed to persist fetched blocks; leaving them uncached"
            );
        }
    }

    fn maybe_log_stats(&self, blocks: u64) {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total / STATS_LOG_INTERVAL == total.saturating_sub(blocks) / STATS_LOG_INTERVAL {
            return;
        }
        let stats = self.stats();
        debug!(
            source = %self.identity,
            total_hits = stats.total_hits,
            total_misses = stats.total_misses,
            source_fetches = stats.source_fetches,
            cache_failures = stats.cache_failures,
            hit_rate = %format!("{:.1}%", stats.hit_rate()),
            fill_rate = %format!("{:.1}%", stats.fill_rate()),
            "cache statistics"
        );
    }
}

impl<C> FileReader for CacheTeeFile<C>
where
    C: CacheOps,
{
    fn size(&self) -> TeeResult<u64> {
        Ok(self.file_size)
    }

    fn read_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<usize> {
        CacheTeeFile::read_at(self, offset, out)
    }

    fn write_identity(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        out.write_str("cachetee:(")?;
        self.source.write_identity(out)?;
        out.write_str(")")
    }
}

impl<C> Drop for CacheTeeFile<C>
where
    C: CacheOps,
{
    fn drop(&mut self) {
        if let Err(err) = self.store.close() {
            warn!(source = %self.identity, error = %err, "failed to flush cache on release");
        }
    }
}

/// Copy the part of `src` (which starts at file offset `src_offset`) that overlaps the request
/// starting at `req_offset` into the matching position of `out`.
fn copy_overlap(src_offset: u64, src: &[u8], req_offset: u64, out: &mut [u8]) {
    let start = src_offset.max(req_offset);
    let end = (src_offset + src.len() as u64).min(req_offset + out.len() as u64);
    if start >= end {
        return;
    }
    let len = (end - start) as usize;
    let src_start = (start - src_offset) as usize;
    let dst_start = (start - req_offset) as usize;
    out[dst_start..dst_start + len].copy_from_slice(&src[src_start..src_start + len]);
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cachetee_core::{FileReader, MemoryFileReader, TeeError, TeeErrorKind, TeeResult};
    use parking_lot::Mutex;

    use super::{CacheTeeConfig, CacheTeeFile, copy_overlap};
    use crate::ops::MemoryCacheOps;

    struct RecordingReader {
        inner: MemoryFileReader,
        requests: Arc<Mutex<Vec<(u64, usize)>>>,
        fail: Arc<AtomicUsize>,
    }

    impl FileReader for RecordingReader {
        fn size(&self) -> TeeResult<u64> {
            self.inner.size()
        }

        fn read_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<usize> {
            if self.fail.load(Ordering::SeqCst) > 0 {
                return Err(TeeError::with_message(TeeErrorKind::Io, "network down"));
            }
            self.requests.lock().push((offset, out.len()));
            self.inner.read_at(offset, out)
        }

        fn write_identity(&self, out: &mut dyn fmt::Write) -> fmt::Result {
            out.write_str("recording")
        }
    }

    struct Fixture {
        tee: CacheTeeFile<Arc<MemoryCacheOps>>,
        data: Vec<u8>,
        requests: Arc<Mutex<Vec<(u64, usize)>>>,
        fail: Arc<AtomicUsize>,
    }

    fn fixture(len: usize, config: CacheTeeConfig) -> Fixture {
        let data = patterned_data(len);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let fail = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(RecordingReader {
            inner: MemoryFileReader::new("fixture", data.clone()),
            requests: Arc::clone(&requests),
            fail: Arc::clone(&fail),
        });
        let tee = CacheTeeFile::open(source, Arc::new(MemoryCacheOps::new()), config)
            .expect("open cache tee");
        Fixture {
            tee,
            data,
            requests,
            fail,
        }
    }

    fn small_blocks() -> CacheTeeConfig {
        CacheTeeConfig {
            block_size: 16,
            ..CacheTeeConfig::default()
        }
    }

    fn patterned_data(len: usize) -> Vec<u8> {
        (0..len).map(|idx| ((idx * 31) % 251) as u8).collect()
    }

    #[test]
    fn miss_fetches_block_aligned_span_once() {
        let fx = fixture(100, small_blocks());
        let out = fx.tee.read_vec_at(20, 30).expect("read");
        assert_eq!(out, fx.data[20..50]);
        assert_eq!(fx.requests.lock().as_slice(), &[(16, 48)]);
    }

    #[test]
    fn mixed_runs_fetch_only_gaps() {
        let fx = fixture(100, small_blocks());
        fx.tee.read_vec_at(16, 16).expect("warm block 1");
        fx.tee.read_vec_at(64, 16).expect("warm block 4");
        fx.requests.lock().clear();

        let out = fx.tee.read_vec_at(5, 90).expect("read across runs");
        assert_eq!(out, fx.data[5..95]);
        assert_eq!(
            fx.requests.lock().as_slice(),
            &[(0, 16), (32, 32), (80, 16)]
        );
    }

    #[test]
    fn warm_read_skips_source() {
        let fx = fixture(100, small_blocks());
        let cold = fx.tee.read_vec_at(3, 97).expect("cold");
        fx.requests.lock().clear();
        let warm = fx.tee.read_vec_at(3, 97).expect("warm");
        assert_eq!(cold, warm);
        assert!(fx.requests.lock().is_empty());
        assert!(fx.tee.is_complete());
        let stats = fx.tee.stats();
        assert_eq!(stats.total_misses, 7);
        assert_eq!(stats.total_hits, 7);
        assert_eq!(stats.source_fetches, 1);
        assert_eq!(stats.fill_rate(), 100.0);
    }

    #[test]
    fn reads_clip_at_eof() {
        let fx = fixture(100, small_blocks());
        let mut out = vec![0u8; 50];
        assert_eq!(fx.tee.read_at(90, &mut out).expect("tail"), 10);
        assert_eq!(&out[..10], &fx.data[90..]);
        assert_eq!(fx.tee.read_at(100, &mut out).expect("eof"), 0);
        assert_eq!(fx.tee.read_at(1000, &mut out).expect("past eof"), 0);
        assert_eq!(fx.tee.read_at(0, &mut []).expect("empty"), 0);

        let err = fx.tee.read_exact_at(95, &mut out).expect_err("crosses eof");
        assert_eq!(err.kind(), TeeErrorKind::OutOfRange);
    }

    #[test]
    fn large_runs_split_by_fetch_limit() {
        let config = CacheTeeConfig {
            block_size: 16,
            max_fetch_blocks: 2,
            ..CacheTeeConfig::default()
        };
        let fx = fixture(100, config);
        let out = fx.tee.read_vec_at(0, 100).expect("read all");
        assert_eq!(out, fx.data);
        assert_eq!(
            fx.requests.lock().as_slice(),
            &[(0, 32), (32, 32), (64, 32), (96, 4)]
        );
    }

    fn truncate_cache(fx: &Fixture, bytes: usize) {
        let ops = fx.tee.store().ops();
        let mut contents = ops.snapshot();
        contents.truncate(contents.len() - bytes);
        ops.replace(contents);
    }

    #[test]
    fn truncated_cache_falls_back_to_source() {
        let fx = fixture(1000, CacheTeeConfig::with_block_size(64));
        assert_eq!(fx.tee.read_vec_at(0, 1000).expect("warm"), fx.data);
        assert!(fx.tee.is_complete());
        truncate_cache(&fx, 300);
        fx.requests.lock().clear();

        let out = fx.tee.read_vec_at(10, 990).expect("read despite short cache");
        assert_eq!(out, fx.data[10..]);
        assert_eq!(fx.tee.stats().cache_failures, 1);
        assert_eq!(fx.requests.lock().as_slice(), &[(0, 1000)]);
        // Data bytes 700.. are gone, so blocks from 10 (640..704) onward lose their bits.
        assert!(fx.tee.store().is_set(9));
        assert!(!fx.tee.store().is_set(10));
        assert_eq!(fx.tee.completeness().cached_blocks, 10);

        fx.requests.lock().clear();
        assert_eq!(fx.tee.read_vec_at(0, 1000).expect("repopulate"), fx.data);
        assert_eq!(fx.requests.lock().as_slice(), &[(640, 360)]);
        assert!(fx.tee.is_complete());
        assert_eq!(fx.tee.stats().cache_failures, 1);

        fx.requests.lock().clear();
        assert_eq!(fx.tee.read_vec_at(0, 1000).expect("warm again"), fx.data);
        assert!(fx.requests.lock().is_empty());
    }

    #[test]
    fn cache_read_fallback_respects_fetch_limit() {
        let config = CacheTeeConfig {
            block_size: 16,
            max_fetch_blocks: 2,
            ..CacheTeeConfig::default()
        };
        let fx = fixture(100, config);
        fx.tee.ensure_cached(0, 100).expect("warm");
        truncate_cache(&fx, 4);
        fx.requests.lock().clear();

        let out = fx.tee.read_vec_at(0, 100).expect("read despite short cache");
        assert_eq!(out, fx.data);
        assert_eq!(
            fx.requests.lock().as_slice(),
            &[(0, 32), (32, 32), (64, 32), (96, 4)]
        );
        assert_eq!(fx.tee.completeness().cached_blocks, 6);
    }

    #[test]
    fn source_errors_propagate_without_caching() {
        let fx = fixture(100, small_blocks());
        fx.fail.store(1, Ordering::SeqCst);
        let err = fx.tee.read_vec_at(0, 10).expect_err("source down");
        assert_eq!(err.kind(), TeeErrorKind::SourceRead);
        assert!(!fx.tee.store().is_set(0));

        fx.fail.store(0, Ordering::SeqCst);
        assert_eq!(fx.tee.read_vec_at(0, 10).expect("recovered"), fx.data[..10]);
        assert!(fx.tee.store().is_set(0));
    }

    #[test]
    fn ensure_cached_fills_without_output() {
        let fx = fixture(100, small_blocks());
        fx.tee.ensure_cached(10, 40).expect("warm");
        let completeness = fx.tee.completeness();
        assert_eq!(completeness.cached_blocks, 4);
        assert_eq!(completeness.cached_bytes, 64);
        fx.tee.ensure_cached(0, u64::MAX).expect("warm rest");
        assert!(fx.tee.is_complete());
        assert_eq!(fx.tee.completeness().cached_bytes, 100);
    }

    #[test]
    fn zero_block_size_selects_default() {
        let fx = fixture(40_000, CacheTeeConfig::with_block_size(0));
        assert_eq!(fx.tee.block_size(), 16 * 1024);
        assert_eq!(fx.tee.completeness().total_blocks, 3);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let source = Arc::new(MemoryFileReader::new("x", vec![0u8; 10]));
        let config = CacheTeeConfig {
            max_fetch_blocks: 0,
            ..CacheTeeConfig::default()
        };
        let err = CacheTeeFile::open(source, MemoryCacheOps::new(), config)
            .err()
            .expect("zero fetch limit");
        assert_eq!(err.kind(), TeeErrorKind::InvalidInput);
    }

    #[test]
    fn identity_wraps_source() {
        let fx = fixture(10, small_blocks());
        assert_eq!(cachetee_core::identity_string(&fx.tee), "cachetee:(recording)");
        assert_eq!(FileReader::size(&fx.tee).expect("size"), 10);
    }

    #[test]
    fn copy_overlap_trims_both_ends() {
        let src: Vec<u8> = (0..32).collect();
        let mut out = vec![0u8; 10];
        copy_overlap(16, &src, 20, &mut out);
        assert_eq!(out, (4..14).collect::<Vec<u8>>());

        let mut out = vec![0xffu8; 10];
        copy_overlap(16, &src[..4], 10, &mut out);
        assert_eq!(&out[6..], &[0, 1, 2, 3]);
        assert!(out[..6].iter().all(|byte| *byte == 0xff));
    }
}
