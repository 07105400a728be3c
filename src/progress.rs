use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    Analyzing,
    FetchingToc,
    CheckingCache,
    DownloadingChapters,
    DownloadingImages,
    GeneratingArchive,
    CleaningUp,
    Completed,
    Cancelled,
    Failed,
}

impl SyncPhase {
    /// `(base, weight)` of this phase within overall 0–100 progress.
    pub fn range(self) -> (f64, f64) {
        match self {
            Self::Analyzing => (0.0, 5.0),
            Self::FetchingToc => (5.0, 3.0),
            Self::CheckingCache => (8.0, 2.0),
            Self::DownloadingChapters => (10.0, 60.0),
            Self::DownloadingImages => (70.0, 5.0),
            Self::GeneratingArchive => (75.0, 20.0),
            Self::CleaningUp => (95.0, 5.0),
            Self::Completed => (100.0, 0.0),
            Self::Cancelled | Self::Failed => (0.0, 0.0),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Analyzing => "analyzing",
            Self::FetchingToc => "fetching toc",
            Self::CheckingCache => "checking cache",
            Self::DownloadingChapters => "downloading chapters",
            Self::DownloadingImages => "downloading images",
            Self::GeneratingArchive => "generating archive",
            Self::CleaningUp => "cleaning up",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    /// Progress within the current phase, 0–100.
    pub phase_progress: f64,
    /// Weighted progress over the whole pipeline, 0–100.
    pub overall_progress: f64,
    pub message: String,
}

impl SyncProgress {
    /// Start of `phase` (phase-local 0).
    pub fn entering(phase: SyncPhase, message: impl Into<String>) -> Self {
        let (base, _) = phase.range();
        Self {
            phase,
            phase_progress: 0.0,
            overall_progress: base,
            message: message.into(),
        }
    }

    /// Chapter downloads. Skipped (already cached) chapters advance the
    /// phase-local value but not the overall value.
    pub fn chapters(completed: usize, skipped: usize, failed: usize, total: usize) -> Self {
        let (base, weight) = SyncPhase::DownloadingChapters.range();
        let phase_progress = percent(completed + skipped, total);
        let overall_progress = base + weight * percent(completed, total) / 100.0;
        Self {
            phase: SyncPhase::DownloadingChapters,
            phase_progress,
            overall_progress,
            message: format!(
                "chapters: {completed} downloaded, {skipped} cached, {failed} failed of {total}"
            ),
        }
    }

    pub fn images(processed: usize, total: usize) -> Self {
        Self::linear(SyncPhase::DownloadingImages, processed, total, "images")
    }

    pub fn archive(processed: usize, total: usize) -> Self {
        Self::linear(SyncPhase::GeneratingArchive, processed, total, "fragments")
    }

    pub fn completed() -> Self {
        Self {
            phase: SyncPhase::Completed,
            phase_progress: 100.0,
            overall_progress: 100.0,
            message: "completed".to_string(),
        }
    }

    pub fn terminal(phase: SyncPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            phase_progress: 0.0,
            overall_progress: 0.0,
            message: message.into(),
        }
    }

    fn linear(phase: SyncPhase, processed: usize, total: usize, noun: &str) -> Self {
        let (base, weight) = phase.range();
        let phase_progress = percent(processed, total);
        Self {
            phase,
            phase_progress,
            overall_progress: base + weight * phase_progress / 100.0,
            message: format!("{noun}: {processed}/{total}"),
        }
    }
}

fn percent(numerator: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (numerator as f64 * 100.0 / total as f64).clamp(0.0, 100.0)
}

pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &SyncProgress);
}

impl<F> ProgressObserver for F
where
    F: Fn(&SyncProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &SyncProgress) {
        self(progress)
    }
}

/// Best-effort fan-out to an optional observer. A panicking observer is
/// logged and otherwise ignored.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl ProgressReporter {
    pub fn new(observer: Option<Arc<dyn ProgressObserver>>) -> Self {
        Self { observer }
    }

    pub fn report(&self, progress: SyncProgress) {
        tracing::debug!(
            phase = progress.phase.label(),
            phase_progress = progress.phase_progress,
            overall = progress.overall_progress,
            "progress"
        );
        let Some(observer) = &self.observer else {
            return;
        };
        let result = catch_unwind(AssertUnwindSafe(|| observer.on_progress(&progress)));
        if result.is_err() {
            tracing::warn!(phase = progress.phase.label(), "progress observer panicked");
        }
    }
}
