use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download a work and write it as an EPUB, resuming from the cache.
    Sync(SyncArgs),
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Work identifier on the remote source.
    #[arg(long)]
    pub work_id: String,

    /// Base URL of the remote source (must be http/https).
    #[arg(long)]
    pub base_url: String,

    /// Source flavour: `plain` or `protected` (defaults to `NOVELSYNC_SOURCE`, then `plain`).
    #[arg(long)]
    pub source: Option<String>,

    /// Output directory for the generated archive.
    #[arg(long)]
    pub out: String,

    /// Scratch directory for the resumable cache (defaults to `NOVELSYNC_CACHE_DIR`).
    #[arg(long)]
    pub cache_dir: Option<String>,

    /// First chapter sequence number to include.
    #[arg(long)]
    pub from: Option<u32>,

    /// Last chapter sequence number to include.
    #[arg(long)]
    pub to: Option<u32>,

    /// Previously generated archive whose chapters may be reused.
    #[arg(long)]
    pub existing: Option<String>,

    /// Ignore the existing archive and download everything again.
    #[arg(long, default_value_t = false)]
    pub force: bool,

    /// Download chapters that failed in a previous run again.
    #[arg(long, default_value_t = false)]
    pub retry_failed: bool,

    /// Abort on the first chapter failure instead of writing a placeholder.
    #[arg(long, default_value_t = false)]
    pub fail_fast: bool,

    /// Maximum concurrent chapter downloads.
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// BCP-47 language tag for the archive metadata.
    #[arg(long, default_value = "und")]
    pub lang: String,
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Show what the cache holds for a work.
    Status(CacheArgs),
    /// Delete the cache of a work.
    Clear(CacheArgs),
}

#[derive(Debug, Args)]
pub struct CacheArgs {
    #[arg(long)]
    pub work_id: String,

    /// Scratch directory for the resumable cache (defaults to `NOVELSYNC_CACHE_DIR`).
    #[arg(long)]
    pub cache_dir: Option<String>,
}
