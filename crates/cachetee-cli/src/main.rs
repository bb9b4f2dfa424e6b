use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{InspectArgs, ReadArgs, WarmArgs, run_inspect, run_read, run_warm};

#[derive(Parser)]
#[command(author, version, about = "cachetee CLI utilities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a byte range of a file through its cache sidecar; writes bytes to stdout.
    Read(ReadArgs),
    /// Populate the cache sidecar for a byte range without printing the data.
    Warm(WarmArgs),
    /// Print the header and population of an existing cache sidecar.
    Inspect(InspectArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_default_tracing();
    match cli.command {
        Commands::Read(args) => run_read(args),
        Commands::Warm(args) => run_warm(args),
        Commands::Inspect(args) => run_inspect(args),
    }
}

fn setup_default_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_read_with_cache_options() {
        let cli = Cli::try_parse_from([
            "cachetee",
            "read",
            "org.dat",
            "--offset",
            "4096",
            "--length",
            "100",
            "--cache-dir",
            "/tmp/cache",
            "--block-size",
            "8192",
        ])
        .expect("parse read");
        let Commands::Read(args) = cli.command else {
            panic!("expected read subcommand");
        };
        assert_eq!(args.offset, 4096);
        assert_eq!(args.length, Some(100));
        assert_eq!(args.cache.block_size, 8192);
        assert_eq!(
            args.cache.cache_dir.as_deref(),
            Some(std::path::Path::new("/tmp/cache"))
        );
        assert_eq!(args.output, "-");
    }
}
