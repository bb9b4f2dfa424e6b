use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{debug, info};

use super::{CacheArgs, open_cache_tee, resolve_range};

#[derive(Args, Debug)]
pub struct WarmArgs {
    /// Backing file whose cache sidecar should be populated.
    #[arg(value_name = "FILE")]
    pub backing: PathBuf,
    /// Byte offset to start warming at.
    #[arg(long, default_value_t = 0)]
    pub offset: u64,
    /// Number of bytes to warm; defaults to the rest of the file.
    #[arg(long)]
    pub length: Option<u64>,
    /// Bytes requested per step, which bounds progress reporting.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    pub chunk: u64,
    #[command(flatten)]
    pub cache: CacheArgs,
}

pub fn run_warm(args: WarmArgs) -> Result<()> {
    let tee = open_cache_tee(&args.backing, &args.cache)?;
    let (offset, len) = resolve_range(tee.file_size(), args.offset, args.length)?;
    let chunk = args.chunk.max(1);

    let mut done = 0u64;
    while done < len {
        let step = (len - done).min(chunk);
        tee.ensure_cached(offset + done, step).with_context(|| {
            format!("warming {} at offset {}", args.backing.display(), offset + done)
        })?;
        done += step;
        let completeness = tee.completeness();
        debug!(
            warmed_bytes = done,
            cached_blocks = completeness.cached_blocks,
            total_blocks = completeness.total_blocks,
            "warm progress"
        );
    }
    tee.flush().context("flushing cache sidecar")?;

    let completeness = tee.completeness();
    let stats = tee.stats();
    info!(
        source_fetches = stats.source_fetches,
        cache_failures = stats.cache_failures,
        "warm complete"
    );
    println!(
        "{}: {}/{} blocks cached ({:.1}%){}",
        args.backing.display(),
        completeness.cached_blocks,
        completeness.total_blocks,
        completeness.percent(),
        if completeness.is_complete() { ", complete" } else { "" }
    );
    Ok(())
}
