use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheStore;
use crate::cli::{CacheArgs, SyncArgs};
use crate::config::{SourceKind, resolve_cache_dir};
use crate::formats::{SyncOptions, SyncResult};
use crate::progress::{ProgressObserver, SyncPhase, SyncProgress};
use crate::sync::SyncOrchestrator;

pub async fn sync(args: SyncArgs) -> anyhow::Result<()> {
    let kind = match args.source.as_deref() {
        Some(raw) => SourceKind::parse(raw)?,
        None => SourceKind::from_env()?,
    };
    let source = kind.connect(&args.base_url).context("connect source")?;

    let mut options = SyncOptions::new(&args.out, resolve_cache_dir(args.cache_dir.as_deref()));
    options.start_order = args.from;
    options.end_order = args.to;
    options.force_redownload = args.force;
    options.retry_failed_chapters = args.retry_failed;
    options.continue_on_error = !args.fail_fast;
    options.existing_archive = args.existing.as_ref().map(Into::into);
    options.concurrency = args.concurrency.max(1);
    options.language = args.lang.clone();

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping after the current step");
            ctrl_c.cancel();
        }
    });

    let orchestrator = SyncOrchestrator::with_epub(source);
    let result = orchestrator
        .sync_work(
            &args.work_id,
            &options,
            Some(phase_logger()),
            Some(cancel),
        )
        .await;

    match result {
        SyncResult::Success {
            archive_path,
            stats,
            ..
        } => {
            tracing::info!(
                downloaded = stats.downloaded,
                reused = stats.reused,
                cached = stats.skipped,
                failed = stats.failed,
                locked = stats.locked,
                "sync finished"
            );
            println!("{}", archive_path.display());
            Ok(())
        }
        SyncResult::Failure { message, .. } => {
            anyhow::bail!("sync {} failed: {message}", args.work_id)
        }
        SyncResult::Cancelled { .. } => {
            anyhow::bail!(
                "sync {} cancelled; rerun the same command to resume",
                args.work_id
            )
        }
    }
}

/// Logs each phase once, the first time it is reported.
fn phase_logger() -> Arc<dyn ProgressObserver> {
    let last = Mutex::new(None::<SyncPhase>);
    Arc::new(move |progress: &SyncProgress| {
        let Ok(mut last) = last.lock() else {
            return;
        };
        if *last != Some(progress.phase) {
            *last = Some(progress.phase);
            tracing::info!(
                phase = progress.phase.label(),
                overall = %format!("{:.0}%", progress.overall_progress),
                "{}",
                progress.message
            );
        }
    })
}

pub async fn cache_status(args: CacheArgs) -> anyhow::Result<()> {
    let cache = CacheStore::new(resolve_cache_dir(args.cache_dir.as_deref()), &args.work_id);
    let Some(state) = cache.state().await? else {
        println!("no cache for {}", args.work_id);
        return Ok(());
    };
    println!("work:        {}", state.work_id);
    println!("title:       {}", state.title);
    println!("fingerprint: {}", state.fingerprint);
    println!("cached:      {}", state.cached_chapter_ids.len());
    println!("failed:      {}", state.failed_chapter_ids.len());
    println!("path:        {}", cache.root().display());
    Ok(())
}

pub async fn cache_clear(args: CacheArgs) -> anyhow::Result<()> {
    let cache = CacheStore::new(resolve_cache_dir(args.cache_dir.as_deref()), &args.work_id);
    if !cache.exists().await {
        println!("no cache for {}", args.work_id);
        return Ok(());
    }
    cache.cleanup().await?;
    println!("removed {}", cache.root().display());
    Ok(())
}
