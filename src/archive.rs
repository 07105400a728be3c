use std::collections::BTreeSet;
use std::path::Path;

use crate::formats::BookInfo;

#[derive(Debug, Clone)]
pub struct ArchiveMetadata {
    pub book: BookInfo,
    /// BCP-47 language tag.
    pub language: String,
}

/// One rendered chapter (or placeholder) in reading order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFragment {
    pub chapter_id: String,
    pub title: String,
    pub sequence: u32,
    pub volume_name: Option<String>,
    pub html: String,
}

/// A binary resource referenced from fragments as `images/{file_name}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveImage {
    pub file_name: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
    pub is_cover: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Replace an existing file at the output path.
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveProvenance {
    pub work_id: String,
    pub downloaded_ids: BTreeSet<String>,
    pub failed_ids: BTreeSet<String>,
}

pub trait ArchiveBuilder: Send + Sync {
    fn file_extension(&self) -> &'static str;

    fn build(
        &self,
        metadata: &ArchiveMetadata,
        fragments: &[ArchiveFragment],
        images: &[ArchiveImage],
        out_path: &Path,
        options: &BuildOptions,
    ) -> anyhow::Result<()>;
}

/// An open, read-only archive. Dropping the handle releases the file.
pub trait ArchiveHandle: Send {
    fn provenance(&mut self) -> anyhow::Result<ArchiveProvenance>;
    fn read_fragment(&mut self, chapter_id: &str) -> anyhow::Result<Option<String>>;
    /// Reads a resource by the href fragments use (e.g. `images/x.png`).
    fn read_resource(&mut self, href: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

pub trait ArchiveReader: Send + Sync {
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn ArchiveHandle>>;
}
