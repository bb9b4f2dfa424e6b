use cachetee_core::{TeeError, TeeErrorKind, TeeResult};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::bitmap::BlockBitmap;
use crate::ops::{CacheOps, read_exact_at, read_prefix_at, write_zero_region};

const CACHE_MAGIC: [u8; 7] = *b"CACHTEE";
const CACHE_VERSION: u8 = 1;
/// Encoded header length: magic, version, block size and file size.
pub const CACHE_HEADER_LEN: usize = 20;
pub const DEFAULT_FLUSH_BLOCKS: u32 = 64;

/// Fixed prefix of a cache file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheHeader {
    pub block_size: u32,
    pub file_size: u64,
}

impl CacheHeader {
    pub fn encode(&self) -> [u8; CACHE_HEADER_LEN] {
        let mut out = [0u8; CACHE_HEADER_LEN];
        out[0..7].copy_from_slice(&CACHE_MAGIC);
        out[7] = CACHE_VERSION;
        out[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        out[12..20].copy_from_slice(&self.file_size.to_le_bytes());
        out
    }

    pub fn decode(prefix: &[u8; CACHE_HEADER_LEN]) -> TeeResult<Self> {
        if prefix[0..7] != CACHE_MAGIC {
            return Err(TeeError::with_message(
                TeeErrorKind::InvalidCacheFormat,
                "cache magic mismatch",
            ));
        }
        if prefix[7] != CACHE_VERSION {
            return Err(TeeError::with_message(
                TeeErrorKind::InvalidCacheFormat,
                format!("unsupported cache version {}", prefix[7]),
            ));
        }
        let block_size = u32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]);
        let file_size = u64::from_le_bytes([
            prefix[12], prefix[13], prefix[14], prefix[15], prefix[16], prefix[17], prefix[18],
            prefix[19],
        ]);
        if block_size == 0 {
            return Err(TeeError::with_message(
                TeeErrorKind::InvalidCacheFormat,
                "cache header has zero block size",
            ));
        }
        Ok(Self {
            block_size,
            file_size,
        })
    }

    pub fn block_count(&self) -> u64 {
        self.file_size.div_ceil(self.block_size as u64)
    }
}

/// Geometry of a cache file for one backing file and block size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheLayout {
    block_size: u32,
    file_size: u64,
    block_count: u64,
    bitmap_bytes: u64,
    data_offset: u64,
    total_len: u64,
}

impl CacheLayout {
    pub fn new(file_size: u64, block_size: u32) -> TeeResult<Self> {
        if block_size == 0 {
            return Err(TeeError::with_message(
                TeeErrorKind::InvalidInput,
                "block size must be non-zero",
            ));
        }
        let block_count = file_size.div_ceil(block_size as u64);
        let bitmap_bytes = block_count.div_ceil(8);
        if bitmap_bytes > usize::MAX as u64 {
            return Err(TeeError::with_message(
                TeeErrorKind::OutOfRange,
                "bitmap exceeds addressable memory",
            ));
        }
        let data_offset = (CACHE_HEADER_LEN as u64)
            .checked_add(bitmap_bytes)
            .ok_or_else(|| TeeError::with_message(TeeErrorKind::OutOfRange, "bitmap overflow"))?;
        let total_len = data_offset.checked_add(file_size).ok_or_else(|| {
            TeeError::with_message(TeeErrorKind::OutOfRange, "cache length overflow")
        })?;
        Ok(Self {
            block_size,
            file_size,
            block_count,
            bitmap_bytes,
            data_offset,
            total_len,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn header(&self) -> CacheHeader {
        CacheHeader {
            block_size: self.block_size,
            file_size: self.file_size,
        }
    }

    /// Index of the block holding byte `offset`.
    pub fn block_of(&self, offset: u64) -> u64 {
        offset / self.block_size as u64
    }

    /// Backing-file byte offset and length covered by `count` blocks starting at `first`.
    ///
    /// The final block is clipped at end of file.
    pub fn span(&self, first: u64, count: u64) -> (u64, usize) {
        let bs = self.block_size as u64;
        let start = first.saturating_mul(bs).min(self.file_size);
        let end = first
            .saturating_add(count)
            .saturating_mul(bs)
            .min(self.file_size);
        (start, (end - start) as usize)
    }

    fn bitmap_len_usize(&self) -> usize {
        self.bitmap_bytes as usize
    }
}

/// How much of the backing file a cache holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completeness {
    pub cached_blocks: u64,
    pub total_blocks: u64,
    pub cached_bytes: u64,
    pub total_bytes: u64,
}

impl Completeness {
    fn from_bitmap(layout: &CacheLayout, bitmap: &BlockBitmap) -> Self {
        let cached_blocks = bitmap.count_set();
        let mut cached_bytes = cached_blocks.saturating_mul(layout.block_size as u64);
        if layout.block_count > 0 && bitmap.is_set(layout.block_count - 1) {
            let (_, last_len) = layout.span(layout.block_count - 1, 1);
            cached_bytes -= layout.block_size as u64 - last_len as u64;
        }
        Self {
            cached_blocks,
            total_blocks: layout.block_count,
            cached_bytes,
            total_bytes: layout.file_size,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.cached_blocks == self.total_blocks
    }

    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.cached_bytes as f64 / self.total_bytes as f64) * 100.0
    }
}

/// Header and population of a cache file, read without a backing file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SidecarSummary {
    pub header: CacheHeader,
    pub completeness: Completeness,
}

/// Header, presence bitmap and sparse data region stored in one cache file.
///
/// Block bytes are written before their bits are set. The on-disk bitmap trails the in-memory
/// one: dirty bits are written only after the data region has been synced, so a crash can lose
/// cached blocks but never expose a bit for bytes that did not reach the disk.
pub struct CacheStore<C> {
    ops: C,
    layout: CacheLayout,
    flush_every_blocks: u32,
    reused: bool,
    state: Mutex<StoreState>,
    mutation_lock: Mutex<()>,
}

struct StoreState {
    bitmap: BlockBitmap,
    dirty: Option<(u64, u64)>,
    blocks_since_flush: u32,
}

impl StoreState {
    fn mark_dirty(&mut self, start: u64, end: u64) {
        self.dirty = Some(match self.dirty {
            Some((lo, hi)) => (lo.min(start), hi.max(end)),
            None => (start, end),
        });
    }
}

impl<C> CacheStore<C>
where
    C: CacheOps,
{
    /// Open the cache file behind `ops`, reusing its contents when they describe this exact
    /// geometry and rebuilding it from scratch otherwise.
    pub fn open(
        ops: C,
        file_size: u64,
        block_size: u32,
        flush_every_blocks: u32,
    ) -> TeeResult<Self> {
        if flush_every_blocks == 0 {
            return Err(TeeError::with_message(
                TeeErrorKind::InvalidInput,
                "flush block limit must be non-zero",
            ));
        }
        let layout = CacheLayout::new(file_size, block_size)?;
        let (bitmap, reused) = match load_existing(&ops, &layout) {
            Ok(bitmap) => {
                debug!(
                    block_size,
                    file_size,
                    cached_blocks = bitmap.count_set(),
                    total_blocks = layout.block_count,
                    "cache opened with existing data"
                );
                (bitmap, true)
            }
            Err(err) => {
                debug!(
                    block_size,
                    file_size,
                    reason = %err,
                    "discarding cache contents; reinitializing cache file"
                );
                (initialize(&ops, &layout)?, false)
            }
        };
        Ok(Self {
            ops,
            layout,
            flush_every_blocks,
            reused,
            state: Mutex::new(StoreState {
                bitmap,
                dirty: None,
                blocks_since_flush: 0,
            }),
            mutation_lock: Mutex::new(()),
        })
    }

    /// Read the header and population of an existing cache file.
    pub fn inspect(ops: &C) -> TeeResult<SidecarSummary> {
        let header = read_header(ops)?;
        let layout = CacheLayout::new(header.file_size, header.block_size)?;
        let bitmap = read_bitmap(ops, &layout)?;
        Ok(SidecarSummary {
            header,
            completeness: Completeness::from_bitmap(&layout, &bitmap),
        })
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Whether `open` found a usable cache from an earlier run.
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn ops(&self) -> &C {
        &self.ops
    }

    pub fn is_set(&self, block: u64) -> bool {
        self.state.lock().bitmap.is_set(block)
    }

    /// Presence value of `start` and the length of the run sharing it, stopping at `end`.
    pub fn next_run(&self, start: u64, end: u64) -> (bool, u64) {
        let state = self.state.lock();
        let hit = state.bitmap.is_set(start);
        (hit, state.bitmap.run_len(start, end, hit))
    }

    pub fn bitmap_snapshot(&self) -> BlockBitmap {
        self.state.lock().bitmap.clone()
    }

    pub fn completeness(&self) -> Completeness {
        Completeness::from_bitmap(&self.layout, &self.state.lock().bitmap)
    }

    /// Copy cached blocks `[first, first + count)` into `out`.
    ///
    /// Every block must already be set and `out` must be exactly the blocks' byte span. A cache
    /// file that turns out to be shorter than its bitmap claims has the bits cleared from the block
    /// holding the first missing byte onward; blocks read in full before it stay cached.
    pub fn read_blocks(&self, first: u64, count: u64, out: &mut [u8]) -> TeeResult<()> {
        self.check_blocks(first, count, out.len())?;
        {
            let state = self.state.lock();
            if state.bitmap.run_len(first, first + count, true) < count {
                return Err(TeeError::with_message(
                    TeeErrorKind::PreconditionViolation,
                    format!("read of uncached blocks {first}+{count}"),
                ));
            }
        }
        let offset = self.data_offset_for_block(first);
        let filled = read_prefix_at(&self.ops, offset, out)
            .map_err(|err| err.reclassify(TeeErrorKind::CacheRead, "read cached blocks"))?;
        if filled == out.len() {
            return Ok(());
        }
        let short_block = first + filled as u64 / self.layout.block_size as u64;
        self.invalidate(short_block, first + count - short_block);
        Err(TeeError::with_message(
            TeeErrorKind::CacheRead,
            format!("cache file truncated at block {short_block} inside blocks {first}+{count}"),
        ))
    }

    /// Persist blocks `[first, first + count)` and mark them present.
    ///
    /// `data` must be exactly the blocks' byte span. Bits are set only after the whole write
    /// succeeded; on error nothing is marked. Returns the number of newly cached blocks.
    pub fn write_blocks(&self, first: u64, count: u64, data: &[u8]) -> TeeResult<u64> {
        self.check_blocks(first, count, data.len())?;
        let _guard = self.mutation_lock.lock();

        let offset = self.data_offset_for_block(first);
        self.ops
            .write_at(offset, data)
            .map_err(|err| err.reclassify(TeeErrorKind::CacheWrite, "write cached blocks"))?;

        let (newly_cached, should_flush) = {
            let mut state = self.state.lock();
            let newly_cached = state.bitmap.set_range(first, count);
            state.mark_dirty(first, first + count);
            state.blocks_since_flush = state
                .blocks_since_flush
                .saturating_add(u32::try_from(newly_cached).unwrap_or(u32::MAX));
            (
                newly_cached,
                state.blocks_since_flush >= self.flush_every_blocks,
            )
        };
        trace!(
            first,
            count,
            newly_cached,
            bytes = data.len(),
            should_flush,
            "cache blocks populated"
        );
        if should_flush {
            if let Err(err) = self.flush_locked() {
                warn!(error = %err, "periodic cache flush failed; bitmap stays dirty");
            }
        }
        Ok(newly_cached)
    }

    pub fn write_block(&self, block: u64, data: &[u8]) -> TeeResult<bool> {
        Ok(self.write_blocks(block, 1, data)? == 1)
    }

    /// Sync cached data, then persist any bitmap bits that changed since the last flush.
    pub fn flush(&self) -> TeeResult<()> {
        let _guard = self.mutation_lock.lock();
        self.flush_locked()
    }

    pub fn close(&self) -> TeeResult<()> {
        self.flush()?;
        debug!(
            cached_blocks = self.state.lock().bitmap.count_set(),
            total_blocks = self.layout.block_count,
            "cache store closed"
        );
        Ok(())
    }

    fn flush_locked(&self) -> TeeResult<()> {
        let Some((start, end)) = self.state.lock().dirty else {
            return Ok(());
        };

        self.ops
            .flush()
            .map_err(|err| err.reclassify(TeeErrorKind::CacheWrite, "sync cache data"))?;

        let (byte_offset, chunk) = {
            let state = self.state.lock();
            let (byte_offset, bytes) = state.bitmap.byte_span(start, end);
            (byte_offset, bytes.to_vec())
        };
        self.ops
            .write_at(CACHE_HEADER_LEN as u64 + byte_offset as u64, &chunk)
            .map_err(|err| err.reclassify(TeeErrorKind::CacheWrite, "write cache bitmap"))?;
        self.ops
            .flush()
            .map_err(|err| err.reclassify(TeeErrorKind::CacheWrite, "sync cache bitmap"))?;

        let mut state = self.state.lock();
        state.dirty = None;
        let blocks_since_flush = std::mem::take(&mut state.blocks_since_flush);
        debug!(
            blocks_since_flush,
            cached_blocks = state.bitmap.count_set(),
            bitmap_bytes = chunk.len(),
            "cache flushed"
        );
        Ok(())
    }

    fn invalidate(&self, first: u64, count: u64) {
        let _guard = self.mutation_lock.lock();
        let mut state = self.state.lock();
        let removed = state.bitmap.clear_range(first, count);
        if removed > 0 {
            state.mark_dirty(first, first + count);
        }
        warn!(first, count, removed, "cache blocks invalidated");
    }

    fn check_blocks(&self, first: u64, count: u64, len: usize) -> TeeResult<()> {
        let in_range = first
            .checked_add(count)
            .is_some_and(|end| count > 0 && end <= self.layout.block_count);
        if !in_range {
            return Err(TeeError::with_message(
                TeeErrorKind::PreconditionViolation,
                format!(
                    "block range {first}+{count} outside {} blocks",
                    self.layout.block_count
                ),
            ));
        }
        let (_, expected) = self.layout.span(first, count);
        if len != expected {
            return Err(TeeError::with_message(
                TeeErrorKind::PreconditionViolation,
                format!("buffer of {len} bytes does not match block span of {expected} bytes"),
            ));
        }
        Ok(())
    }

    fn data_offset_for_block(&self, block: u64) -> u64 {
        let (start, _) = self.layout.span(block, 0);
        self.layout.data_offset + start
    }
}

fn read_header<C: CacheOps + ?Sized>(ops: &C) -> TeeResult<CacheHeader> {
    let mut prefix = [0u8; CACHE_HEADER_LEN];
    if !read_exact_at(ops, 0, &mut prefix)? {
        return Err(TeeError::with_message(
            TeeErrorKind::InvalidCacheFormat,
            "cache header missing",
        ));
    }
    CacheHeader::decode(&prefix)
}

fn read_bitmap<C: CacheOps + ?Sized>(ops: &C, layout: &CacheLayout) -> TeeResult<BlockBitmap> {
    let mut bits = vec![0u8; layout.bitmap_len_usize()];
    if !read_exact_at(ops, CACHE_HEADER_LEN as u64, &mut bits)? {
        return Err(TeeError::with_message(
            TeeErrorKind::InvalidCacheFormat,
            "cache bitmap truncated",
        ));
    }
    BlockBitmap::deserialize(&bits, layout.block_count)
}

fn load_existing<C: CacheOps + ?Sized>(ops: &C, layout: &CacheLayout) -> TeeResult<BlockBitmap> {
    let header = read_header(ops)?;
    if header != layout.header() {
        return Err(TeeError::with_message(
            TeeErrorKind::InvalidCacheFormat,
            format!(
                "cache geometry mismatch: stored block_size={} file_size={}, expected block_size={} file_size={}",
                header.block_size, header.file_size, layout.block_size, layout.file_size
            ),
        ));
    }
    let bitmap = read_bitmap(ops, layout)?;
    if bitmap.count_set() > 0 && layout.total_len > layout.data_offset {
        let mut probe = [0u8; 1];
        if !read_exact_at(ops, layout.total_len - 1, &mut probe)? {
            return Err(TeeError::with_message(
                TeeErrorKind::InvalidCacheFormat,
                "cache data region truncated",
            ));
        }
    }
    ops.set_len(layout.total_len)?;
    Ok(bitmap)
}

fn initialize<C: CacheOps + ?Sized>(ops: &C, layout: &CacheLayout) -> TeeResult<BlockBitmap> {
    let result = (|| {
        ops.set_len(0)?;
        ops.set_len(layout.total_len)?;
        ops.write_at(0, &layout.header().encode())?;
        write_zero_region(ops, CACHE_HEADER_LEN as u64, layout.bitmap_bytes)?;
        ops.flush()
    })();
    result.map_err(|err| err.reclassify(TeeErrorKind::CacheWrite, "initialize cache file"))?;
    debug!(
        block_size = layout.block_size,
        file_size = layout.file_size,
        total_blocks = layout.block_count,
        cache_len = layout.total_len,
        "cache file initialized with clean state"
    );
    Ok(BlockBitmap::new(layout.block_count))
}
