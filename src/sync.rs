//! The resumable sync pipeline.
//!
//! A run fetches the table of contents, fingerprints it, reconciles it with
//! the on-disk cache and an optional previously generated archive, downloads
//! only what is missing, and writes a fresh archive. The cache directory is
//! the only checkpoint: it survives failures and cancellation and is removed
//! once an archive has been written.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;

use crate::archive::{
    ArchiveBuilder, ArchiveFragment, ArchiveHandle, ArchiveImage, ArchiveMetadata,
    ArchiveProvenance, ArchiveReader, BuildOptions,
};
use crate::cache::{self, CacheStore};
use crate::crypto::DecryptError;
use crate::epub::{self, EpubBuilder, EpubReader};
use crate::fingerprint;
use crate::formats::{
    BookInfo, CachedChapter, CachedImageRef, ChapterStatus, SyncOptions, SyncResult,
    SyncStatistics, TocChapter,
};
use crate::marker;
use crate::progress::{ProgressObserver, ProgressReporter, SyncPhase, SyncProgress};
use crate::source::ContentSource;

/// Returned through `anyhow` when a run observes its cancellation token.
#[derive(Debug, thiserror::Error)]
#[error("sync cancelled")]
pub struct SyncCancelled;

pub struct SyncOrchestrator {
    source: Arc<dyn ContentSource>,
    builder: Arc<dyn ArchiveBuilder>,
    reader: Arc<dyn ArchiveReader>,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn ContentSource>,
        builder: Arc<dyn ArchiveBuilder>,
        reader: Arc<dyn ArchiveReader>,
    ) -> Self {
        Self {
            source,
            builder,
            reader,
        }
    }

    pub fn with_epub(source: Arc<dyn ContentSource>) -> Self {
        Self::new(source, Arc::new(EpubBuilder), Arc::new(EpubReader))
    }

    pub async fn sync_work(
        &self,
        work_id: &str,
        options: &SyncOptions,
        observer: Option<Arc<dyn ProgressObserver>>,
        cancel: Option<CancellationToken>,
    ) -> SyncResult {
        let mut run = SyncRun {
            work_id,
            options,
            reporter: ProgressReporter::new(observer),
            cancel: cancel.unwrap_or_default(),
            book: None,
            started_at: Instant::now(),
        };

        tracing::info!(
            work_id,
            source = self.source.name(),
            output_dir = %options.output_dir.display(),
            "sync: start"
        );

        match self.run(&mut run).await {
            Ok(result) => result,
            Err(err) if err.downcast_ref::<SyncCancelled>().is_some() => {
                tracing::info!(work_id, "sync: cancelled; cache retained");
                run.reporter
                    .report(SyncProgress::terminal(SyncPhase::Cancelled, "cancelled"));
                SyncResult::Cancelled { book: run.book }
            }
            Err(err) => {
                let decrypt = err.downcast_ref::<DecryptError>().is_some();
                tracing::warn!(work_id, decrypt, error = %format!("{err:#}"), "sync: failed; cache retained");
                let message = format!("{err:#}");
                run.reporter
                    .report(SyncProgress::terminal(SyncPhase::Failed, message.clone()));
                SyncResult::Failure {
                    message,
                    book: run.book,
                }
            }
        }
    }

    async fn run(&self, run: &mut SyncRun<'_>) -> anyhow::Result<SyncResult> {
        let options = run.options;
        let work_id = run.work_id;

        // Analyzing
        run.reporter.report(SyncProgress::entering(
            SyncPhase::Analyzing,
            "analyzing existing archive",
        ));
        let prior = match options.existing_archive.as_deref() {
            Some(path) if !options.force_redownload => self.open_prior_archive(path, work_id).await,
            _ => None,
        };
        run.ensure_active()?;

        // FetchingToc
        run.reporter.report(SyncProgress::entering(
            SyncPhase::FetchingToc,
            "fetching table of contents",
        ));
        let listing = self
            .source
            .fetch_toc(work_id)
            .await
            .with_context(|| format!("fetch toc for {work_id}"))?;
        let mut book = listing.book;
        if book.work_id.is_empty() {
            book.work_id = work_id.to_string();
        }
        run.book = Some(book.clone());
        if listing.chapters.is_empty() {
            anyhow::bail!("table of contents for {work_id} is empty");
        }

        let mut selection = listing
            .chapters
            .into_iter()
            .filter(|chapter| options.in_range(chapter.sequence))
            .collect::<Vec<_>>();
        selection.sort_by(|a, b| (a.sequence, &a.id).cmp(&(b.sequence, &b.id)));
        if selection.is_empty() {
            anyhow::bail!(
                "no chapters of {work_id} fall within the requested range ({:?}..={:?})",
                options.start_order,
                options.end_order
            );
        }
        let fingerprint = fingerprint::compute_for_chapters(&selection);
        tracing::info!(
            work_id,
            title = %book.title,
            chapters = selection.len(),
            fingerprint = %fingerprint,
            "sync: toc fetched"
        );
        run.ensure_active()?;

        // CheckingCache
        run.reporter.report(SyncProgress::entering(
            SyncPhase::CheckingCache,
            "checking cache",
        ));
        let cache = CacheStore::new(&options.cache_dir, work_id);
        let cache_state = match cache.state().await? {
            Some(state) if state.is_valid(&fingerprint) => {
                tracing::info!(
                    work_id,
                    cached = state.cached_chapter_ids.len(),
                    failed = state.failed_chapter_ids.len(),
                    "sync: resuming from cache"
                );
                Some(state)
            }
            Some(state) => {
                tracing::info!(
                    work_id,
                    old = %state.fingerprint,
                    new = %fingerprint,
                    "sync: table of contents changed; discarding cache"
                );
                cache.cleanup().await?;
                None
            }
            None => {
                if cache.exists().await {
                    cache.cleanup().await?;
                }
                None
            }
        };
        cache
            .initialize(&fingerprint, Some(book.title.as_str()))
            .await
            .context("initialize cache")?;
        let cache_index = cache.chapter_index().await?;
        run.ensure_active()?;

        let plan = DownloadPlan::new(
            &selection,
            options,
            prior.as_ref().map(|p| &p.provenance),
            cache_state.as_ref().map(|s| (&s.cached_chapter_ids, &s.failed_chapter_ids)),
            &cache_index,
        );
        tracing::info!(
            work_id,
            to_download = plan.to_fetch.len(),
            from_cache = plan.from_cache,
            locked = plan.locked,
            "sync: download plan"
        );

        // DownloadingChapters
        let mut stats = SyncStatistics {
            total_chapters: selection.len(),
            locked: plan.locked,
            skipped: plan.from_cache,
            ..SyncStatistics::default()
        };
        let mut failed_ids = BTreeSet::new();
        self.download_chapters(run, &cache, &plan, &mut stats, &mut failed_ids)
            .await?;
        run.ensure_active()?;

        // DownloadingImages
        let cache_index = cache.chapter_index().await?;
        stats.images_downloaded = self
            .download_images(run, &cache, &book, &selection, &cache_index)
            .await?;
        run.ensure_active()?;

        // GeneratingArchive
        run.reporter.report(SyncProgress::entering(
            SyncPhase::GeneratingArchive,
            "generating archive",
        ));
        let (fragments, images) = self
            .resolve_fragments(
                run,
                &cache,
                &book,
                &selection,
                &cache_index,
                prior,
                &mut stats,
                &mut failed_ids,
            )
            .await?;
        run.ensure_active()?;

        let out_path = options.output_dir.join(format!(
            "{}.{}",
            archive_file_stem(&book.title, work_id),
            self.builder.file_extension()
        ));
        let metadata = ArchiveMetadata {
            book: book.clone(),
            language: options.language.clone(),
        };
        let fragment_count = fragments.len();
        let builder = Arc::clone(&self.builder);
        let build_path = out_path.clone();
        tokio::task::spawn_blocking(move || {
            builder.build(
                &metadata,
                &fragments,
                &images,
                &build_path,
                &BuildOptions { overwrite: true },
            )
        })
        .await
        .context("join archive builder")?
        .with_context(|| format!("write archive: {}", out_path.display()))?;
        tracing::debug!(work_id, fragments = fragment_count, "sync: archive written");

        // CleaningUp
        run.reporter.report(SyncProgress::entering(
            SyncPhase::CleaningUp,
            "removing cache",
        ));
        cache.cleanup().await.context("remove cache after success")?;

        stats.failed = failed_ids.len();
        stats.failed_chapter_ids = failed_ids.into_iter().collect();
        stats.duration = run.started_at.elapsed();
        tracing::info!(
            work_id,
            archive = %out_path.display(),
            downloaded = stats.downloaded,
            reused = stats.reused,
            skipped = stats.skipped,
            failed = stats.failed,
            locked = stats.locked,
            images = stats.images_downloaded,
            elapsed_ms = stats.duration.as_millis() as u64,
            "sync: completed"
        );
        run.reporter.report(SyncProgress::completed());

        Ok(SyncResult::Success {
            archive_path: out_path,
            book,
            stats,
        })
    }

    async fn open_prior_archive(&self, path: &Path, work_id: &str) -> Option<PriorArchive> {
        let reader = Arc::clone(&self.reader);
        let archive_path = path.to_path_buf();
        let opened = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<PriorArchive>> {
            if !archive_path.exists() {
                return Ok(None);
            }
            let mut handle = reader.open(&archive_path)?;
            let provenance = handle.provenance()?;
            Ok(Some(PriorArchive { handle, provenance }))
        })
        .await
        .context("join archive reader")
        .and_then(|opened| opened);
        let prior = match opened {
            Ok(Some(prior)) => prior,
            Ok(None) => {
                tracing::debug!(path = %path.display(), "existing archive not found");
                return None;
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "ignoring unreadable archive");
                return None;
            }
        };
        let provenance = &prior.provenance;
        if provenance.work_id != work_id {
            tracing::warn!(
                path = %path.display(),
                archive_work_id = %provenance.work_id,
                work_id,
                "ignoring archive of a different work"
            );
            return None;
        }
        tracing::info!(
            path = %path.display(),
            downloaded = provenance.downloaded_ids.len(),
            failed = provenance.failed_ids.len(),
            "sync: analyzed existing archive"
        );
        Some(prior)
    }

    async fn download_chapters(
        &self,
        run: &SyncRun<'_>,
        cache: &CacheStore,
        plan: &DownloadPlan,
        stats: &mut SyncStatistics,
        failed_ids: &mut BTreeSet<String>,
    ) -> anyhow::Result<()> {
        let total = plan.to_fetch.len() + plan.from_cache;
        let concurrency = run.options.concurrency.max(1).min(plan.to_fetch.len().max(1));
        let mut failed_here = 0_usize;
        run.reporter
            .report(SyncProgress::chapters(0, plan.from_cache, 0, total));

        let mut join_set = tokio::task::JoinSet::new();
        let mut next_idx = 0_usize;
        while next_idx < plan.to_fetch.len() || !join_set.is_empty() {
            while next_idx < plan.to_fetch.len() && join_set.len() < concurrency {
                run.ensure_active()?;
                let chapter = plan.to_fetch[next_idx].clone();
                let source = Arc::clone(&self.source);
                let work_id = run.work_id.to_string();
                let cancel = run.cancel.clone();
                join_set.spawn(async move {
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => None,
                        result = fetch_chapter_content(source.as_ref(), &work_id, &chapter) => Some(result),
                    };
                    (chapter, outcome)
                });
                next_idx += 1;
            }

            let joined = tokio::select! {
                _ = run.cancel.cancelled() => return Err(SyncCancelled.into()),
                joined = join_set.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let (chapter, outcome) = joined.context("join chapter task")?;
            match outcome {
                None => return Err(SyncCancelled.into()),
                Some(Ok(cached)) => {
                    cache.save_chapter(&cached).await?;
                    stats.downloaded += 1;
                    tracing::debug!(
                        work_id = run.work_id,
                        chapter_id = %chapter.id,
                        words = cached.word_count.unwrap_or(0),
                        "chapter downloaded"
                    );
                }
                Some(Err(err)) => {
                    if !run.options.continue_on_error {
                        return Err(err.context(format!("chapter {} failed", chapter.id)));
                    }
                    let decrypt = err.downcast_ref::<DecryptError>().is_some();
                    let reason = format!("{err:#}");
                    tracing::warn!(
                        work_id = run.work_id,
                        chapter_id = %chapter.id,
                        decrypt,
                        error = %reason,
                        "chapter failed; continuing"
                    );
                    cache
                        .save_chapter(&CachedChapter::failed(&chapter, reason))
                        .await?;
                    failed_ids.insert(chapter.id.clone());
                    failed_here += 1;
                }
            }

            run.reporter.report(SyncProgress::chapters(
                stats.downloaded,
                plan.from_cache,
                failed_here,
                total,
            ));
        }
        Ok(())
    }

    async fn download_images(
        &self,
        run: &SyncRun<'_>,
        cache: &CacheStore,
        book: &BookInfo,
        selection: &[TocChapter],
        cache_index: &HashMap<String, CachedChapter>,
    ) -> anyhow::Result<usize> {
        let mut wanted = BTreeMap::new();
        if let Some(url) = book.cover_url.as_deref().filter(|u| !u.trim().is_empty()) {
            wanted.insert(cache::image_id_for_url(url), url.to_string());
        }
        for chapter in selection {
            let Some(cached) = cache_index.get(&chapter.id) else {
                continue;
            };
            if cached.status != ChapterStatus::Downloaded {
                continue;
            }
            for image in &cached.images {
                wanted
                    .entry(image.image_id.clone())
                    .or_insert_with(|| image.source_url.clone());
            }
        }

        let mut pending = Vec::new();
        for (image_id, url) in wanted {
            if !cache.image_exists(&image_id).await {
                pending.push((image_id, url));
            }
        }

        run.reporter.report(SyncProgress::images(0, pending.len()));
        let mut downloaded = 0_usize;
        for (idx, (image_id, url)) in pending.iter().enumerate() {
            run.ensure_active()?;
            let fetched = tokio::select! {
                _ = run.cancel.cancelled() => return Err(SyncCancelled.into()),
                fetched = self.source.fetch_image(url) => fetched,
            };
            match fetched {
                Ok(bytes) if !bytes.is_empty() => {
                    cache.save_image(image_id, &bytes).await?;
                    downloaded += 1;
                }
                Ok(_) => {
                    tracing::warn!(work_id = run.work_id, url = %url, "image is empty; skipping");
                }
                Err(err) => {
                    tracing::warn!(
                        work_id = run.work_id,
                        url = %url,
                        error = %format!("{err:#}"),
                        "image download failed; skipping"
                    );
                }
            }
            run.reporter.report(SyncProgress::images(idx + 1, pending.len()));
        }
        Ok(downloaded)
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_fragments(
        &self,
        run: &SyncRun<'_>,
        cache: &CacheStore,
        book: &BookInfo,
        selection: &[TocChapter],
        cache_index: &HashMap<String, CachedChapter>,
        prior: Option<PriorArchive>,
        stats: &mut SyncStatistics,
        failed_ids: &mut BTreeSet<String>,
    ) -> anyhow::Result<(Vec<ArchiveFragment>, Vec<ArchiveImage>)> {
        let mut images = ImageCollector::default();
        let mut fragments = Vec::with_capacity(selection.len());

        // Consumes the prior handle, so the archive is closed before the new
        // one is written over it.
        let mut reused = match prior {
            Some(prior) => {
                let wanted = selection
                    .iter()
                    .filter(|c| c.is_available() && !cache_index.contains_key(&c.id))
                    .map(|c| c.id.clone())
                    .collect::<Vec<_>>();
                tokio::task::spawn_blocking(move || load_prior_fragments(prior, &wanted))
                    .await
                    .context("join archive reader")??
            }
            None => PriorFragments::default(),
        };

        if let Some(url) = book.cover_url.as_deref().filter(|u| !u.trim().is_empty()) {
            images.add_cached(cache, url, true).await?;
        }

        for (idx, chapter) in selection.iter().enumerate() {
            let html = if !chapter.is_available() {
                marker::locked_placeholder(chapter)
            } else if let Some(cached) = cache_index.get(&chapter.id) {
                match (cached.status, cached.html_body.as_deref()) {
                    (ChapterStatus::Downloaded, Some(body)) => {
                        let mut replacements = HashMap::new();
                        for image in &cached.images {
                            if let Some(href) = images.add_cached(cache, &image.source_url, false).await? {
                                replacements.insert(image.source_url.clone(), href);
                            }
                        }
                        let body = marker::rewrite_image_sources(body, &replacements);
                        marker::wrap_chapter_content(chapter, &body)
                    }
                    _ => {
                        failed_ids.insert(chapter.id.clone());
                        marker::failed_placeholder(chapter, cached.failure_reason.as_deref())
                    }
                }
            } else if let Some(fragment) = reused.fragments.remove(&chapter.id) {
                stats.reused += 1;
                fragment
            } else {
                failed_ids.insert(chapter.id.clone());
                marker::failed_placeholder(chapter, Some("chapter was not downloaded"))
            };

            fragments.push(ArchiveFragment {
                chapter_id: chapter.id.clone(),
                title: chapter.title.clone(),
                sequence: chapter.sequence,
                volume_name: chapter.volume_name.clone(),
                html,
            });
            run.reporter
                .report(SyncProgress::archive(idx + 1, selection.len()));
            run.ensure_active()?;
        }

        images.add_archive_images(reused.images);
        Ok((fragments, images.into_images()))
    }
}

struct SyncRun<'a> {
    work_id: &'a str,
    options: &'a SyncOptions,
    reporter: ProgressReporter,
    cancel: CancellationToken,
    book: Option<BookInfo>,
    started_at: Instant,
}

impl SyncRun<'_> {
    fn ensure_active(&self) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncCancelled.into());
        }
        Ok(())
    }
}

struct PriorArchive {
    handle: Box<dyn ArchiveHandle>,
    provenance: ArchiveProvenance,
}

/// Which chapters a run must fetch and which it can serve locally.
#[derive(Debug, Default)]
struct DownloadPlan {
    to_fetch: Vec<TocChapter>,
    /// Available chapters whose content is already in the cache.
    from_cache: usize,
    locked: usize,
}

impl DownloadPlan {
    fn new(
        selection: &[TocChapter],
        options: &SyncOptions,
        prior: Option<&ArchiveProvenance>,
        usable_cache: Option<(&BTreeSet<String>, &BTreeSet<String>)>,
        cache_index: &HashMap<String, CachedChapter>,
    ) -> Self {
        let mut have = HashSet::<&str>::new();
        let mut previously_failed = HashSet::<&str>::new();
        if let Some(prior) = prior {
            have.extend(prior.downloaded_ids.iter().map(String::as_str));
            previously_failed.extend(prior.failed_ids.iter().map(String::as_str));
        }
        if let Some((cached, failed)) = usable_cache {
            have.extend(cached.iter().map(String::as_str));
            previously_failed.extend(failed.iter().map(String::as_str));
        }
        if options.retry_failed_chapters {
            for id in &previously_failed {
                have.remove(id);
            }
        } else {
            have.extend(previously_failed.iter().copied());
        }

        let mut plan = Self::default();
        for chapter in selection {
            if !chapter.is_available() {
                plan.locked += 1;
                continue;
            }
            let cached_ok = cache_index
                .get(&chapter.id)
                .is_some_and(|c| c.status == ChapterStatus::Downloaded);
            if cached_ok {
                plan.from_cache += 1;
                continue;
            }
            let retry = options.retry_failed_chapters && previously_failed.contains(chapter.id.as_str());
            if options.force_redownload || retry || !have.contains(chapter.id.as_str()) {
                plan.to_fetch.push(chapter.clone());
            }
        }
        plan
    }
}

async fn fetch_chapter_content(
    source: &dyn ContentSource,
    work_id: &str,
    chapter: &TocChapter,
) -> anyhow::Result<CachedChapter> {
    let payload = source
        .fetch_chapter(work_id, chapter)
        .await
        .with_context(|| format!("fetch chapter {}", chapter.id))?;
    let html = payload
        .body
        .into_html()
        .with_context(|| format!("decrypt chapter {}", chapter.id))?;

    // Images the markup already shows keep their in-text position.
    let mut anchored = marker::collect_image_sources(&html)
        .into_iter()
        .collect::<HashSet<_>>();
    let anchors = payload
        .images
        .iter()
        .filter(|image| anchored.insert(image.url.clone()))
        .map(|image| (image.offset, image.url.clone()))
        .collect::<Vec<_>>();
    let html = marker::anchor_images(&html, &anchors);
    let html = marker::add_provenance_markers(&html, &chapter.id);

    let offsets = payload
        .images
        .iter()
        .map(|image| (image.url.as_str(), image.offset))
        .collect::<HashMap<_, _>>();
    let mut seen = HashSet::new();
    let images = marker::collect_image_sources(&html)
        .into_iter()
        .filter(|url| seen.insert(url.clone()))
        .map(|url| CachedImageRef {
            image_id: cache::image_id_for_url(&url),
            offset_hint: offsets.get(url.as_str()).copied().unwrap_or(0),
            media_type: epub::media_type_for_path(&url_path(&url)).to_string(),
            source_url: url,
        })
        .collect();

    Ok(CachedChapter::downloaded(chapter, html, images))
}

/// Fragments and images carried over from a previous archive.
#[derive(Default)]
struct PriorFragments {
    fragments: HashMap<String, String>,
    images: Vec<ArchiveImage>,
}

/// Reads the wanted fragments the prior archive recorded as downloaded, plus
/// the local images they refer to. Blocking.
fn load_prior_fragments(mut prior: PriorArchive, wanted: &[String]) -> anyhow::Result<PriorFragments> {
    let mut loaded = PriorFragments::default();
    let mut seen_files = HashSet::new();
    for chapter_id in wanted {
        if !prior.provenance.downloaded_ids.contains(chapter_id) {
            continue;
        }
        let Some(fragment) = prior
            .handle
            .read_fragment(chapter_id)
            .with_context(|| format!("read chapter {chapter_id} from existing archive"))?
        else {
            continue;
        };
        for src in marker::collect_image_sources(&fragment) {
            let Some(file_name) = src.strip_prefix("images/") else {
                continue;
            };
            if !seen_files.insert(file_name.to_string()) {
                continue;
            }
            match prior.handle.read_resource(&src)? {
                Some(bytes) => loaded.images.push(ArchiveImage {
                    file_name: file_name.to_string(),
                    media_type: epub::media_type_for_path(file_name).to_string(),
                    bytes,
                    is_cover: false,
                }),
                None => tracing::debug!(href = %src, "image missing from existing archive"),
            }
        }
        loaded.fragments.insert(chapter_id.clone(), fragment);
    }
    Ok(loaded)
}

/// Accumulates archive images keyed by file name.
#[derive(Default)]
struct ImageCollector {
    by_file: BTreeMap<String, ArchiveImage>,
    by_url: HashMap<String, Option<String>>,
}

impl ImageCollector {
    /// Adds a cached image by source URL, returning its archive href.
    async fn add_cached(
        &mut self,
        cache: &CacheStore,
        url: &str,
        is_cover: bool,
    ) -> anyhow::Result<Option<String>> {
        if let Some(href) = self.by_url.get(url).cloned() {
            if is_cover && let Some(href) = &href {
                self.mark_cover(href);
            }
            return Ok(href);
        }

        let image_id = cache::image_id_for_url(url);
        let href = match cache.load_image(&image_id).await? {
            Some(bytes) => {
                let file_name = image_file_name(&image_id, url, &bytes);
                let href = format!("images/{file_name}");
                self.by_file
                    .entry(file_name.clone())
                    .or_insert_with(|| ArchiveImage {
                        media_type: epub::media_type_for_path(&file_name).to_string(),
                        file_name,
                        bytes,
                        is_cover,
                    });
                if is_cover {
                    self.mark_cover(&href);
                }
                Some(href)
            }
            None => None,
        };
        self.by_url.insert(url.to_string(), href.clone());
        Ok(href)
    }

    /// Carries over images from reused fragments; cached copies win.
    fn add_archive_images(&mut self, images: Vec<ArchiveImage>) {
        for image in images {
            self.by_file.entry(image.file_name.clone()).or_insert(image);
        }
    }

    fn mark_cover(&mut self, href: &str) {
        if let Some(image) = href
            .strip_prefix("images/")
            .and_then(|file_name| self.by_file.get_mut(file_name))
        {
            image.is_cover = true;
        }
    }

    fn into_images(self) -> Vec<ArchiveImage> {
        self.by_file.into_values().collect()
    }
}

fn image_file_name(image_id: &str, url: &str, bytes: &[u8]) -> String {
    let ext = epub::sniff_image_extension(bytes)
        .map(str::to_owned)
        .or_else(|| {
            Path::new(&url_path(url))
                .extension()
                .and_then(|e| e.to_str())
                .filter(|e| !e.is_empty() && e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
                .map(str::to_ascii_lowercase)
        })
        .unwrap_or_else(|| "bin".to_string());
    format!("{image_id}.{ext}")
}

fn url_path(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

/// File-name-safe stem for the output archive, derived from the book title.
pub fn archive_file_stem(title: &str, work_id: &str) -> String {
    fn clean(raw: &str) -> String {
        let replaced = raw
            .chars()
            .map(|c| {
                if c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                    '_'
                } else {
                    c
                }
            })
            .collect::<String>();
        replaced
            .trim()
            .trim_matches('.')
            .trim()
            .chars()
            .take(120)
            .collect()
    }

    let stem = clean(title);
    if !stem.is_empty() {
        return stem;
    }
    let stem = clean(work_id);
    if !stem.is_empty() {
        return stem;
    }
    "book".to_string()
}
