use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::Utc;
use sha2::Digest as _;
use tokio::fs;
use tokio::sync::Mutex;

use crate::formats::{CacheManifest, CachedChapter, ChapterStatus};

/// Read-only snapshot of a cache manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheState {
    pub work_id: String,
    pub fingerprint: String,
    pub title: String,
    pub cached_chapter_ids: BTreeSet<String>,
    pub failed_chapter_ids: BTreeSet<String>,
}

impl CacheState {
    pub fn is_valid(&self, current_fingerprint: &str) -> bool {
        self.fingerprint == current_fingerprint
    }
}

impl From<CacheManifest> for CacheState {
    fn from(manifest: CacheManifest) -> Self {
        Self {
            work_id: manifest.work_id,
            fingerprint: manifest.toc_fingerprint,
            title: manifest.title,
            cached_chapter_ids: manifest.cached_chapter_ids,
            failed_chapter_ids: manifest.failed_chapter_ids,
        }
    }
}

/// Durable per-work cache of chapter and image artifacts.
///
/// Layout under `<base_dir>/<work id>/`: `manifest.json`, `chapters/<id>.json`,
/// `images/<id>.bin`. One store instance per work id; manifest updates are
/// serialized through an internal lock.
#[derive(Debug)]
pub struct CacheStore {
    work_id: String,
    root: PathBuf,
    manifest_lock: Mutex<()>,
}

impl CacheStore {
    pub fn new(base_dir: impl Into<PathBuf>, work_id: impl Into<String>) -> Self {
        let work_id = work_id.into();
        let root = base_dir.into().join(safe_file_stem(&work_id));
        Self {
            work_id,
            root,
            manifest_lock: Mutex::new(()),
        }
    }

    pub fn work_id(&self) -> &str {
        &self.work_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    fn chapters_dir(&self) -> PathBuf {
        self.root.join("chapters")
    }

    fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    fn chapter_path(&self, chapter_id: &str) -> PathBuf {
        self.chapters_dir()
            .join(format!("{}.json", safe_file_stem(chapter_id)))
    }

    fn image_path(&self, image_id: &str) -> PathBuf {
        self.images_dir()
            .join(format!("{}.bin", safe_file_stem(image_id)))
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.root)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }

    /// Creates the layout and an initial manifest. A manifest that already
    /// exists is left as is.
    pub async fn initialize(&self, fingerprint: &str, title: Option<&str>) -> anyhow::Result<()> {
        let _guard = self.manifest_lock.lock().await;

        for dir in [self.chapters_dir(), self.images_dir()] {
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("create cache dir: {}", dir.display()))?;
        }

        let path = self.manifest_path();
        if read_json::<CacheManifest>(&path).await?.is_some() {
            return Ok(());
        }

        let now = Utc::now();
        let manifest = CacheManifest {
            work_id: self.work_id.clone(),
            toc_fingerprint: fingerprint.to_string(),
            title: title.unwrap_or_default().to_string(),
            cached_chapter_ids: BTreeSet::new(),
            failed_chapter_ids: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        };
        write_json_atomic(&path, &manifest)
            .await
            .context("write cache manifest")?;
        tracing::debug!(work_id = %self.work_id, fingerprint, "initialized cache");
        Ok(())
    }

    pub async fn state(&self) -> anyhow::Result<Option<CacheState>> {
        let path = self.manifest_path();
        let manifest = read_json::<CacheManifest>(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?;
        Ok(manifest.map(CacheState::from))
    }

    /// Persists a chapter artifact, then moves its id into the cached or
    /// failed set of the manifest (never both).
    pub async fn save_chapter(&self, chapter: &CachedChapter) -> anyhow::Result<()> {
        let _guard = self.manifest_lock.lock().await;

        let chapter_path = self.chapter_path(&chapter.chapter_id);
        write_json_atomic(&chapter_path, chapter)
            .await
            .with_context(|| format!("write cached chapter: {}", chapter.chapter_id))?;

        let manifest_path = self.manifest_path();
        let mut manifest = read_json::<CacheManifest>(&manifest_path)
            .await
            .with_context(|| format!("read: {}", manifest_path.display()))?
            .ok_or_else(|| anyhow::anyhow!("cache not initialized: {}", self.root.display()))?;

        let id = chapter.chapter_id.clone();
        match chapter.status {
            ChapterStatus::Downloaded => {
                manifest.failed_chapter_ids.remove(&id);
                manifest.cached_chapter_ids.insert(id);
            }
            ChapterStatus::Failed => {
                manifest.cached_chapter_ids.remove(&id);
                manifest.failed_chapter_ids.insert(id);
            }
        }
        manifest.updated_at = Utc::now();

        write_json_atomic(&manifest_path, &manifest)
            .await
            .context("write cache manifest")?;
        Ok(())
    }

    pub async fn load_chapter(&self, chapter_id: &str) -> anyhow::Result<Option<CachedChapter>> {
        let path = self.chapter_path(chapter_id);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    /// All cached chapters in sequence order.
    pub async fn load_all_chapters(&self) -> anyhow::Result<Vec<CachedChapter>> {
        let dir = self.chapters_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read dir: {}", dir.display()));
            }
        };

        let mut chapters = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("list dir: {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(chapter) = read_json::<CachedChapter>(&path)
                .await
                .with_context(|| format!("read: {}", path.display()))?
            {
                chapters.push(chapter);
            }
        }

        chapters.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.chapter_id.cmp(&b.chapter_id))
        });
        Ok(chapters)
    }

    /// All cached chapters keyed by chapter id.
    pub async fn chapter_index(&self) -> anyhow::Result<HashMap<String, CachedChapter>> {
        Ok(self
            .load_all_chapters()
            .await?
            .into_iter()
            .map(|chapter| (chapter.chapter_id.clone(), chapter))
            .collect())
    }

    pub async fn save_image(&self, image_id: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.image_path(image_id);
        write_bytes_atomic(&path, bytes)
            .await
            .with_context(|| format!("write cached image: {image_id}"))
    }

    pub async fn load_image(&self, image_id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.image_path(image_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read: {}", path.display())),
        }
    }

    pub async fn image_exists(&self, image_id: &str) -> bool {
        fs::metadata(self.image_path(image_id))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    /// Removes the whole per-work cache root.
    pub async fn cleanup(&self) -> anyhow::Result<()> {
        let _guard = self.manifest_lock.lock().await;
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                tracing::debug!(work_id = %self.work_id, root = %self.root.display(), "removed cache");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("remove cache dir: {}", self.root.display()))
            }
        }
    }
}

/// Stable image id derived from its source URL.
pub fn image_id_for_url(url: &str) -> String {
    let digest = sha2::Sha256::digest(url.as_bytes());
    format!("img_{}", hex::encode(&digest[..8]))
}

/// Maps an arbitrary id onto a file-name-safe stem. Ids that are already safe
/// are kept verbatim; anything else gets a hash suffix so distinct ids never
/// collide.
fn safe_file_stem(id: &str) -> String {
    let is_safe = !id.is_empty()
        && id.len() <= 96
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if is_safe {
        return id.to_string();
    }

    let sanitized = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(48)
        .collect::<String>();
    let digest = sha2::Sha256::digest(id.as_bytes());
    format!("{sanitized}~{}", hex::encode(&digest[..6]))
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    write_bytes_atomic(path, &data).await
}

async fn write_bytes_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{ChapterAccess, TocChapter};

    fn toc_chapter(id: &str, seq: u32) -> TocChapter {
        TocChapter {
            id: id.to_owned(),
            title: format!("Chapter {seq}"),
            sequence: seq,
            volume_name: Some("Volume 1".to_owned()),
            access: ChapterAccess::Open,
        }
    }

    #[tokio::test]
    async fn initialize_creates_layout_and_is_idempotent() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = CacheStore::new(temp.path(), "work-1");
        assert!(!store.exists().await);
        assert!(store.state().await?.is_none());

        store.initialize("fp1", Some("Title")).await?;
        assert!(store.exists().await);
        assert!(store.root().join("chapters").is_dir());
        assert!(store.root().join("images").is_dir());

        store
            .save_chapter(&CachedChapter::downloaded(
                &toc_chapter("c1", 1),
                "<p>x</p>".into(),
                Vec::new(),
            ))
            .await?;
        store.initialize("fp-other", None).await?;

        let state = store.state().await?.ok_or_else(|| anyhow::anyhow!("no state"))?;
        assert_eq!(state.work_id, "work-1");
        assert_eq!(state.fingerprint, "fp1");
        assert_eq!(state.title, "Title");
        assert!(state.cached_chapter_ids.contains("c1"));
        Ok(())
    }

    #[tokio::test]
    async fn failed_then_downloaded_is_mutually_exclusive() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = CacheStore::new(temp.path(), "work-1");
        store.initialize("fp", None).await?;
        let ch = toc_chapter("x", 1);

        store.save_chapter(&CachedChapter::failed(&ch, "boom")).await?;
        let state = store.state().await?.ok_or_else(|| anyhow::anyhow!("no state"))?;
        assert!(state.failed_chapter_ids.contains("x"));
        assert!(!state.cached_chapter_ids.contains("x"));

        store
            .save_chapter(&CachedChapter::downloaded(&ch, "<p>ok</p>".into(), Vec::new()))
            .await?;
        let state = store.state().await?.ok_or_else(|| anyhow::anyhow!("no state"))?;
        assert!(state.cached_chapter_ids.contains("x"));
        assert!(!state.failed_chapter_ids.contains("x"));

        store.save_chapter(&CachedChapter::failed(&ch, "again")).await?;
        let state = store.state().await?.ok_or_else(|| anyhow::anyhow!("no state"))?;
        assert!(state.failed_chapter_ids.contains("x"));
        assert!(!state.cached_chapter_ids.contains("x"));

        let loaded = store
            .load_chapter("x")
            .await?
            .ok_or_else(|| anyhow::anyhow!("missing chapter"))?;
        assert_eq!(loaded.status, ChapterStatus::Failed);
        assert_eq!(loaded.failure_reason.as_deref(), Some("again"));
        Ok(())
    }

    #[tokio::test]
    async fn validity_gate_matches_fingerprint_exactly() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = CacheStore::new(temp.path(), "w");
        store.initialize("abcdef0123456789", None).await?;
        let state = store.state().await?.ok_or_else(|| anyhow::anyhow!("no state"))?;
        assert!(state.is_valid("abcdef0123456789"));
        assert!(!state.is_valid("abcdef0123456788"));
        assert!(!state.is_valid(""));
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_removes_everything() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = CacheStore::new(temp.path(), "w");
        store.initialize("fp", None).await?;
        store
            .save_chapter(&CachedChapter::downloaded(
                &toc_chapter("c1", 1),
                "<p>a</p>".into(),
                Vec::new(),
            ))
            .await?;
        store.save_image("img_1", b"\x89PNG").await?;
        assert!(store.image_exists("img_1").await);

        store.cleanup().await?;
        assert!(!store.exists().await);
        assert!(!store.root().exists());
        assert!(store.state().await?.is_none());
        store.cleanup().await?;
        Ok(())
    }

    #[tokio::test]
    async fn chapters_load_in_sequence_order() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = CacheStore::new(temp.path(), "w");
        store.initialize("fp", None).await?;
        for (id, seq) in [("b", 2), ("c", 3), ("a", 1)] {
            store
                .save_chapter(&CachedChapter::downloaded(
                    &toc_chapter(id, seq),
                    format!("<p>{id}</p>"),
                    Vec::new(),
                ))
                .await?;
        }
        let ids = store
            .load_all_chapters()
            .await?
            .into_iter()
            .map(|c| c.chapter_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(store.load_chapter("missing").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn images_round_trip() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = CacheStore::new(temp.path(), "w");
        store.initialize("fp", None).await?;
        assert!(store.load_image("nope").await?.is_none());
        store.save_image("img_a", &[1, 2, 3]).await?;
        assert_eq!(store.load_image("img_a").await?, Some(vec![1, 2, 3]));
        Ok(())
    }

    #[test]
    fn unsafe_ids_map_to_distinct_stems() {
        assert_eq!(safe_file_stem("chapter-12"), "chapter-12");
        let a = safe_file_stem("a/b");
        let b = safe_file_stem("a?b");
        assert_ne!(a, b);
        assert!(!a.contains('/'));
        assert!(safe_file_stem("..").starts_with('~'));
    }

    #[test]
    fn image_ids_are_stable() {
        let a = image_id_for_url("https://example.com/a.png");
        assert_eq!(a, image_id_for_url("https://example.com/a.png"));
        assert_ne!(a, image_id_for_url("https://example.com/b.png"));
        assert!(a.starts_with("img_"));
    }
}
