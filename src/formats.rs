use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookInfo {
    pub work_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterAccess {
    #[default]
    Open,
    Locked,
    Paywalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocChapter {
    pub id: String,
    pub title: String,
    pub sequence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
    #[serde(default)]
    pub access: ChapterAccess,
}

impl TocChapter {
    /// Locked and paywalled chapters are never downloaded.
    pub fn is_available(&self) -> bool {
        self.access == ChapterAccess::Open
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocVolume {
    pub name: String,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocListing {
    pub book: BookInfo,
    #[serde(default)]
    pub volumes: Vec<TocVolume>,
    pub chapters: Vec<TocChapter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    Downloaded,
    Failed,
}

impl ChapterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedImageRef {
    pub image_id: String,
    pub source_url: String,
    pub offset_hint: usize,
    pub media_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedChapter {
    pub chapter_id: String,
    pub title: String,
    pub sequence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
    pub status: ChapterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub images: Vec<CachedImageRef>,
}

impl CachedChapter {
    pub fn downloaded(chapter: &TocChapter, html_body: String, images: Vec<CachedImageRef>) -> Self {
        let word_count = count_words(&html_body);
        Self {
            chapter_id: chapter.id.clone(),
            title: chapter.title.clone(),
            sequence: chapter.sequence,
            volume_name: chapter.volume_name.clone(),
            status: ChapterStatus::Downloaded,
            html_body: Some(html_body),
            word_count: Some(word_count),
            failure_reason: None,
            downloaded_at: Some(Utc::now()),
            images,
        }
    }

    pub fn failed(chapter: &TocChapter, reason: impl Into<String>) -> Self {
        Self {
            chapter_id: chapter.id.clone(),
            title: chapter.title.clone(),
            sequence: chapter.sequence,
            volume_name: chapter.volume_name.clone(),
            status: ChapterStatus::Failed,
            html_body: None,
            word_count: None,
            failure_reason: Some(reason.into()),
            downloaded_at: None,
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub work_id: String,
    pub toc_fingerprint: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub cached_chapter_ids: BTreeSet<String>,
    #[serde(default)]
    pub failed_chapter_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub start_order: Option<u32>,
    pub end_order: Option<u32>,
    pub force_redownload: bool,
    pub retry_failed_chapters: bool,
    pub continue_on_error: bool,
    /// A previously generated archive to reconcile against.
    pub existing_archive: Option<PathBuf>,
    pub concurrency: usize,
    /// BCP-47 language tag written into the archive.
    pub language: String,
}

impl SyncOptions {
    pub fn new(output_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            cache_dir: cache_dir.into(),
            start_order: None,
            end_order: None,
            force_redownload: false,
            retry_failed_chapters: false,
            continue_on_error: true,
            existing_archive: None,
            concurrency: Self::default_concurrency(),
            language: "und".to_string(),
        }
    }

    pub fn default_concurrency() -> usize {
        4
    }

    pub fn in_range(&self, sequence: u32) -> bool {
        self.start_order.is_none_or(|start| sequence >= start)
            && self.end_order.is_none_or(|end| sequence <= end)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatistics {
    pub total_chapters: usize,
    pub downloaded: usize,
    pub reused: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failed_chapter_ids: Vec<String>,
    pub locked: usize,
    pub images_downloaded: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub enum SyncResult {
    Success {
        archive_path: PathBuf,
        book: BookInfo,
        stats: SyncStatistics,
    },
    Failure {
        message: String,
        book: Option<BookInfo>,
    },
    Cancelled {
        book: Option<BookInfo>,
    },
}

impl SyncResult {
    pub fn book(&self) -> Option<&BookInfo> {
        match self {
            Self::Success { book, .. } => Some(book),
            Self::Failure { book, .. } | Self::Cancelled { book } => book.as_ref(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Rough word count of an HTML fragment: CJK characters count individually,
/// everything else by whitespace-separated runs.
pub fn count_words(html: &str) -> usize {
    let mut count = 0_usize;
    let mut in_tag = false;
    let mut in_word = false;
    for ch in html.chars() {
        if in_tag {
            if ch == '>' {
                in_tag = false;
            }
            continue;
        }
        if ch == '<' {
            in_tag = true;
            in_word = false;
            continue;
        }
        if is_cjk(ch) {
            count += 1;
            in_word = false;
        } else if ch.is_whitespace() {
            in_word = false;
        } else if !in_word {
            count += 1;
            in_word = true;
        }
    }
    count
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32, 0x3040..=0x30FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xAC00..=0xD7AF)
}
