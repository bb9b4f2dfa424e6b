use std::path::PathBuf;

use anyhow::{Context, Result};
use cachetee::{CacheStore, SidecarSummary};
use cachetee_store_std::StdCacheOps;
use clap::Args;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Cache sidecar to inspect.
    #[arg(value_name = "SIDECAR")]
    pub sidecar: PathBuf,
}

pub fn run_inspect(args: InspectArgs) -> Result<()> {
    let ops = StdCacheOps::open_existing(&args.sidecar)
        .with_context(|| format!("opening sidecar {}", args.sidecar.display()))?;
    let summary = CacheStore::inspect(&ops)
        .with_context(|| format!("reading sidecar {}", args.sidecar.display()))?;
    print!("{}", render_summary(&summary));
    Ok(())
}

fn render_summary(summary: &SidecarSummary) -> String {
    let completeness = &summary.completeness;
    format!(
        "block_size: {}\nfile_size: {}\nblocks: {}/{}\nbytes: {}/{}\ncomplete: {} ({:.1}%)\n",
        summary.header.block_size,
        summary.header.file_size,
        completeness.cached_blocks,
        completeness.total_blocks,
        completeness.cached_bytes,
        completeness.total_bytes,
        completeness.is_complete(),
        completeness.percent(),
    )
}
