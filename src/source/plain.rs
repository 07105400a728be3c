//! Self-hosted source serving plain HTML chapters over a small JSON API.
//!
//! - `GET {base}/api/works/{work_id}/toc` → [`TocListing`]
//! - `GET {base}/api/works/{work_id}/chapters/{chapter_id}` → `{ "html", "images" }`

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::formats::{TocChapter, TocListing};
use crate::source::{ChapterBody, ChapterPayload, ContentSource, RemoteImage};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct ChapterResponse {
    html: String,
    #[serde(default)]
    images: Vec<RemoteImage>,
}

#[derive(Debug, Clone)]
pub struct PlainHttpSource {
    client: reqwest::Client,
    base_url: Url,
}

impl PlainHttpSource {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).context("parse source base url")?;
        if base_url.scheme() != "http" && base_url.scheme() != "https" {
            anyhow::bail!("source base url must be http/https: {base_url}");
        }
        Ok(Self {
            client: super::http_client(DEFAULT_TIMEOUT_SECS)?,
            base_url,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("source base url cannot have paths: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl ContentSource for PlainHttpSource {
    fn name(&self) -> &'static str {
        "plain"
    }

    async fn fetch_toc(&self, work_id: &str) -> anyhow::Result<TocListing> {
        let url = self.endpoint(&["api", "works", work_id, "toc"])?;
        super::get_json(&self.client, url.as_str())
            .await
            .context("fetch toc")
    }

    async fn fetch_chapter(
        &self,
        work_id: &str,
        chapter: &TocChapter,
    ) -> anyhow::Result<ChapterPayload> {
        let url = self.endpoint(&["api", "works", work_id, "chapters", &chapter.id])?;
        let resp: ChapterResponse = super::get_json(&self.client, url.as_str())
            .await
            .with_context(|| format!("fetch chapter: {}", chapter.id))?;
        Ok(ChapterPayload {
            body: ChapterBody::Plain(resp.html),
            images: resp.images,
        })
    }

    async fn fetch_image(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let resolved = self
            .base_url
            .join(url)
            .with_context(|| format!("resolve image url: {url}"))?;
        super::get_bytes(&self.client, resolved.as_str()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_encodes_ids_as_path_segments() -> anyhow::Result<()> {
        let source = PlainHttpSource::new("http://127.0.0.1:8080/library/")?;
        let url = source.endpoint(&["api", "works", "w 1", "chapters", "a/b"])?;
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8080/library/api/works/w%201/chapters/a%2Fb"
        );
        Ok(())
    }

    #[test]
    fn rejects_non_http_base() {
        assert!(PlainHttpSource::new("file:///tmp").is_err());
    }
}
