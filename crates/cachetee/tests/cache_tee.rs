use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use cachetee::{CacheOps, CacheTeeConfig, CacheTeeFile, MemoryCacheOps};
use cachetee_core::{FileReader, MemoryFileReader, TeeError, TeeErrorKind, TeeResult};
use proptest::prelude::*;

const BLOCK_SIZE: u32 = 16 * 1024;
const BS: u64 = BLOCK_SIZE as u64;
const DATA_FILE_SIZE: usize = 1024 * 1024 + 300;

/// Backing file that counts fetches and can be slowed down to widen race windows.
struct CountingReader {
    inner: MemoryFileReader,
    fetches: AtomicUsize,
    fetched_blocks: Mutex<HashMap<u64, usize>>,
    delay: Option<Duration>,
}

impl CountingReader {
    fn new(data: Vec<u8>) -> Self {
        Self {
            inner: MemoryFileReader::new("org.dat", data),
            fetches: AtomicUsize::new(0),
            fetched_blocks: Mutex::new(HashMap::new()),
            delay: None,
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl FileReader for CountingReader {
    fn size(&self) -> TeeResult<u64> {
        self.inner.size()
    }

    fn read_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<usize> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        {
            let mut blocks = self.fetched_blocks.lock().expect("lock fetch log");
            let end = offset + out.len() as u64;
            for block in offset / BS..end.div_ceil(BS) {
                *blocks.entry(block).or_default() += 1;
            }
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.inner.read_at(offset, out)
    }

    fn write_identity(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        out.write_str("counting")
    }
}

/// Cache file that accepts header setup but refuses every later write.
struct BrokenDiskOps {
    inner: MemoryCacheOps,
    broken: AtomicBool,
    attempts: AtomicUsize,
}

impl CacheOps for BrokenDiskOps {
    fn read_at(&self, offset: u64, out: &mut [u8]) -> TeeResult<usize> {
        self.inner.read_at(offset, out)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> TeeResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            return Err(TeeError::with_message(
                TeeErrorKind::Io,
                "no space left on device",
            ));
        }
        self.inner.write_at(offset, data)
    }

    fn set_len(&self, len: u64) -> TeeResult<()> {
        self.inner.set_len(len)
    }

    fn flush(&self) -> TeeResult<()> {
        self.inner.flush()
    }
}

fn patterned_data(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

fn expected(data: &[u8], offset: u64, len: u64) -> &[u8] {
    let start = (offset as usize).min(data.len());
    let end = (offset.saturating_add(len) as usize).min(data.len());
    &data[start..end]
}

fn open_tee(
    source: Arc<CountingReader>,
    cache: Arc<MemoryCacheOps>,
) -> CacheTeeFile<Arc<MemoryCacheOps>> {
    CacheTeeFile::open(source, cache, CacheTeeConfig::with_block_size(BLOCK_SIZE))
        .expect("open cache tee")
}

fn compare(tee: &CacheTeeFile<Arc<MemoryCacheOps>>, data: &[u8], offset: u64, len: u64) {
    let got = tee.read_vec_at(offset, len as usize).expect("read through tee");
    assert_eq!(
        got.as_slice(),
        expected(data, offset, len),
        "mismatch at offset {offset} len {len}"
    );
}

#[test]
fn reference_read_sequence_matches_backing_file() {
    let data = patterned_data(DATA_FILE_SIZE);
    let source = Arc::new(CountingReader::new(data.clone()));
    let tee = open_tee(Arc::clone(&source), Arc::new(MemoryCacheOps::new()));
    let size = DATA_FILE_SIZE as u64;

    let reads: &[(u64, u64)] = &[
        (0, 100),
        (10, 100),
        (0, 100),
        (10, 100),
        (1024 * BS, 100),
        (1024 * BS, 100),
        (BS / 2, BS),
        (BS / 2, BS),
        (BS / 2, BS * 5 + 100),
        (BS / 2, BS * 5 + 100),
        (100, 1024 * BS + 500),
        (200, 1024 * BS * 3),
        (1024 * BS * 2 + 10, 100),
        (1024 * BS * 2 - 10, 100),
        (size - 100, 300),
        (size - 100, BS * 10),
        (size - 10000, 10000),
    ];
    for &(offset, len) in reads {
        compare(&tee, &data, offset, len);
    }
}

#[test]
fn repeated_reads_do_not_refetch() {
    let data = patterned_data(DATA_FILE_SIZE);
    let source = Arc::new(CountingReader::new(data.clone()));
    let tee = open_tee(Arc::clone(&source), Arc::new(MemoryCacheOps::new()));

    for &(offset, len) in &[(0u64, 100u64), (BS / 2, BS), (BS / 2, BS * 5 + 100)] {
        compare(&tee, &data, offset, len);
        let after_cold = source.fetches();
        compare(&tee, &data, offset, len);
        assert_eq!(source.fetches(), after_cold, "warm read at {offset} fetched again");
    }
}

#[test]
fn eof_reads_return_only_the_tail() {
    let data = patterned_data(DATA_FILE_SIZE);
    let source = Arc::new(CountingReader::new(data.clone()));
    let tee = open_tee(source, Arc::new(MemoryCacheOps::new()));
    let size = DATA_FILE_SIZE as u64;

    let mut out = vec![0u8; 300];
    assert_eq!(tee.read_at(size - 100, &mut out).expect("tail read"), 100);
    assert_eq!(&out[..100], &data[DATA_FILE_SIZE - 100..]);
    assert_eq!(tee.read_at(size, &mut out).expect("eof read"), 0);
}

#[test]
fn block_boundary_reads_are_exact() {
    let data = patterned_data(DATA_FILE_SIZE);
    let source = Arc::new(CountingReader::new(data.clone()));
    let tee = open_tee(source, Arc::new(MemoryCacheOps::new()));

    compare(&tee, &data, 3 * BS, BS);
    compare(&tee, &data, 3 * BS - 1, 2);
    compare(&tee, &data, 4 * BS - 1, 2);
    compare(&tee, &data, 2 * BS, 3 * BS);
}

#[test]
fn cache_survives_reopen() {
    let data = patterned_data(DATA_FILE_SIZE);
    let cache = Arc::new(MemoryCacheOps::new());
    {
        let source = Arc::new(CountingReader::new(data.clone()));
        let tee = open_tee(Arc::clone(&source), Arc::clone(&cache));
        compare(&tee, &data, 0, 5 * BS);
    }

    let source = Arc::new(CountingReader::new(data.clone()));
    let tee = open_tee(Arc::clone(&source), Arc::clone(&cache));
    assert!(tee.store().reused());
    assert_eq!(tee.completeness().cached_blocks, 5);
    compare(&tee, &data, 100, 4 * BS);
    assert_eq!(source.fetches(), 0);
}

#[test]
fn failing_cache_writes_never_corrupt_reads() {
    let data = patterned_data(DATA_FILE_SIZE);
    let source = Arc::new(CountingReader::new(data.clone()));
    let cache = Arc::new(BrokenDiskOps {
        inner: MemoryCacheOps::new(),
        broken: AtomicBool::new(false),
        attempts: AtomicUsize::new(0),
    });
    let tee = CacheTeeFile::open(
        Arc::clone(&source) as Arc<dyn FileReader>,
        Arc::clone(&cache),
        CacheTeeConfig::with_block_size(BLOCK_SIZE),
    )
    .expect("open cache tee");
    cache.broken.store(true, Ordering::SeqCst);

    for round in 0..3 {
        for &(offset, len) in &[(0u64, 100u64), (BS / 2, BS * 5 + 100), (1024 * BS, 100)] {
            let got = tee.read_vec_at(offset, len as usize).expect("read despite broken cache");
            assert_eq!(got.as_slice(), expected(&data, offset, len), "round {round}");
        }
    }
    assert_eq!(tee.completeness().cached_blocks, 0);
    // Two missing runs per round: the head of the file and the five-block span.
    assert_eq!(cache.attempts.load(Ordering::SeqCst), 6);
    assert_eq!(tee.stats().cache_failures, 6);
    tee.close().expect("nothing dirty to flush");
}

#[test]
fn concurrent_readers_fetch_each_block_once() {
    let data = patterned_data(DATA_FILE_SIZE);
    let mut reader = CountingReader::new(data.clone());
    reader.delay = Some(Duration::from_millis(5));
    let source = Arc::new(reader);
    let tee = open_tee(Arc::clone(&source), Arc::new(MemoryCacheOps::new()));

    let threads = 8;
    let barrier = Barrier::new(threads);
    thread::scope(|scope| {
        for idx in 0..threads as u64 {
            let tee = &tee;
            let data = &data;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for round in 0..4u64 {
                    let offset = (idx * 7 + round * 3) * BS / 2;
                    compare(tee, data, offset, 6 * BS + 17);
                }
            });
        }
    });

    let fetched = source.fetched_blocks.lock().expect("lock fetch log");
    for (block, count) in fetched.iter() {
        assert_eq!(*count, 1, "block {block} fetched {count} times");
    }

    // Every read covers 7 blocks. Blocks found cached after waiting count as hits.
    let stats = tee.stats();
    assert_eq!(stats.total_misses, fetched.len() as u64);
    assert_eq!(stats.total_hits + stats.total_misses, threads as u64 * 4 * 7);
}

#[test]
fn concurrent_readers_take_over_after_failed_cache_writes() {
    let data = patterned_data(DATA_FILE_SIZE);
    let mut reader = CountingReader::new(data.clone());
    reader.delay = Some(Duration::from_millis(2));
    let source = Arc::new(reader);
    let cache = Arc::new(BrokenDiskOps {
        inner: MemoryCacheOps::new(),
        broken: AtomicBool::new(false),
        attempts: AtomicUsize::new(0),
    });
    let tee = CacheTeeFile::open(
        Arc::clone(&source) as Arc<dyn FileReader>,
        Arc::clone(&cache),
        CacheTeeConfig::with_block_size(BLOCK_SIZE),
    )
    .expect("open cache tee");
    cache.broken.store(true, Ordering::SeqCst);

    let threads = 8;
    let barrier = Barrier::new(threads);
    thread::scope(|scope| {
        for idx in 0..threads as u64 {
            let tee = &tee;
            let data = &data;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for round in 0..6u64 {
                    let offset = ((idx + round) % 4) * BS + idx * 100;
                    let got = tee
                        .read_vec_at(offset, (4 * BS) as usize)
                        .expect("read despite broken cache");
                    assert_eq!(
                        got.as_slice(),
                        expected(data, offset, 4 * BS),
                        "thread {idx} round {round}"
                    );
                }
            });
        }
    });

    assert_eq!(tee.completeness().cached_blocks, 0);
    let stats = tee.stats();
    assert_eq!(stats.cache_failures, cache.attempts.load(Ordering::SeqCst) as u64);
    assert!(stats.cache_failures > 0);
    assert_eq!(stats.total_hits, 0);
}

#[test]
fn shared_handle_reads_from_many_threads() {
    let data = patterned_data(DATA_FILE_SIZE);
    let source = Arc::new(CountingReader::new(data.clone()));
    let tee = Arc::new(open_tee(source, Arc::new(MemoryCacheOps::new())));
    let data = Arc::new(data);

    let handles: Vec<_> = (0..4u64)
        .map(|idx| {
            let tee = Arc::clone(&tee);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                let offset = idx * 10 * BS + 123;
                compare(&tee, &data, offset, 20 * BS);
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("reader thread");
    }
    compare(&tee, &data, 0, DATA_FILE_SIZE as u64);
    assert!(tee.is_complete());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn reads_are_transparent(
        ops in proptest::collection::vec((0u64..12_000, 0u64..4_000), 1..16),
        block_size in prop_oneof![Just(512u32), Just(1000u32), Just(4096u32)],
    ) {
        let data = patterned_data(10_007);
        let source = Arc::new(CountingReader::new(data.clone()));
        let tee = CacheTeeFile::open(
            source,
            MemoryCacheOps::new(),
            CacheTeeConfig::with_block_size(block_size),
        )
        .expect("open cache tee");
        for (offset, len) in ops {
            let got = tee.read_vec_at(offset, len as usize).expect("read through tee");
            prop_assert_eq!(got.as_slice(), expected(&data, offset, len));
        }
    }
}
