use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use super::{CacheArgs, open_cache_tee, resolve_range};

const COPY_CHUNK_LEN: usize = 1024 * 1024;

#[derive(Args, Debug)]
pub struct ReadArgs {
    /// Backing file to read through the cache.
    #[arg(value_name = "FILE")]
    pub backing: PathBuf,
    /// Byte offset to start reading at.
    #[arg(long, default_value_t = 0)]
    pub offset: u64,
    /// Number of bytes to read; defaults to the rest of the file.
    #[arg(long)]
    pub length: Option<u64>,
    /// Output path ("-" for stdout).
    #[arg(short, long, value_name = "OUTPUT", default_value = "-")]
    pub output: String,
    #[command(flatten)]
    pub cache: CacheArgs,
}

pub fn run_read(args: ReadArgs) -> Result<()> {
    let tee = open_cache_tee(&args.backing, &args.cache)?;
    let (offset, len) = resolve_range(tee.file_size(), args.offset, args.length)?;

    let mut out: Box<dyn Write> = if args.output == "-" {
        Box::new(BufWriter::new(std::io::stdout().lock()))
    } else {
        let file = File::create(&args.output)
            .with_context(|| format!("creating output file {}", args.output))?;
        Box::new(BufWriter::new(file))
    };

    let mut buf = vec![0u8; COPY_CHUNK_LEN.min(len as usize)];
    let mut done = 0u64;
    while done < len {
        let want = (len - done).min(buf.len() as u64) as usize;
        let chunk = &mut buf[..want];
        tee.read_exact_at(offset + done, chunk).with_context(|| {
            format!("reading {} at offset {}", args.backing.display(), offset + done)
        })?;
        out.write_all(chunk).context("writing output")?;
        done += want as u64;
    }
    out.flush().context("flushing output")?;
    tee.flush().context("flushing cache sidecar")?;

    let stats = tee.stats();
    info!(
        bytes = len,
        hits = stats.total_hits,
        misses = stats.total_misses,
        source_fetches = stats.source_fetches,
        cache_failures = stats.cache_failures,
        hit_rate = %format!("{:.1}%", stats.hit_rate()),
        "read complete"
    );
    Ok(())
}
