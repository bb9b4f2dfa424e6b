//! Write-mode caching layer over a slow or remote read-only file.
//!
//! [`CacheTeeFile`] serves reads from a local cache file when the covering blocks are present and
//! from the backing [`FileReader`](cachetee_core::FileReader) otherwise, writing fetched blocks
//! back so later reads (and later processes) find them cached. The cache file layout is
//!
//! ```text
//! [magic "CACHTEE"][version u8][block_size u32 LE][file_size u64 LE][bitmap][data region]
//! ```
//!
//! where the bitmap holds one bit per block and the data region mirrors the backing file byte for
//! byte at offset `20 + bitmap length`.

pub mod bitmap;
pub mod ops;
pub mod store;
pub mod tee;

pub use bitmap::BlockBitmap;
pub use ops::{CacheOps, MemoryCacheOps};
pub use store::{
    CACHE_HEADER_LEN, CacheHeader, CacheLayout, CacheStore, Completeness, DEFAULT_FLUSH_BLOCKS,
    SidecarSummary,
};
pub use tee::{
    CacheStats, CacheTeeConfig, CacheTeeFile, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_FETCH_BLOCKS,
};
