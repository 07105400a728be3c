//! Source whose chapter bodies are encrypted under a per-session key.
//!
//! Handshake: `POST {base}/v1/session` with the encrypted device-id request
//! returns a key blob, from which the session content key is derived. If the
//! handshake fails, chapters are still requested and decrypted with the
//! default key.

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use url::Url;

use crate::crypto;
use crate::formats::{TocChapter, TocListing};
use crate::source::{ChapterBody, ChapterPayload, ContentSource, RemoteImage};

pub const KEY_EXCHANGE_VERSION: u32 = 1;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Serialize)]
struct SessionRequest<'a> {
    version: u32,
    device_id: u64,
    payload: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    key_blob: String,
}

#[derive(Debug, Deserialize)]
struct ChapterResponse {
    content: String,
    #[serde(default)]
    images: Vec<RemoteImage>,
}

#[derive(Debug)]
pub struct ProtectedHttpSource {
    client: reqwest::Client,
    base_url: Url,
    device_id: u64,
    session_key: OnceCell<Option<String>>,
}

impl ProtectedHttpSource {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).context("parse source base url")?;
        if base_url.scheme() != "http" && base_url.scheme() != "https" {
            anyhow::bail!("source base url must be http/https: {base_url}");
        }
        Ok(Self {
            client: super::http_client(DEFAULT_TIMEOUT_SECS)?,
            base_url,
            device_id: rand::random::<u64>(),
            session_key: OnceCell::new(),
        })
    }

    pub fn with_device_id(mut self, device_id: u64) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    fn endpoint(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("source base url cannot have paths: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// The negotiated session key, or `None` when falling back to the default key.
    pub async fn session_key(&self) -> Option<String> {
        self.session_key
            .get_or_init(|| async {
                match self.negotiate_session_key().await {
                    Ok(key) => {
                        tracing::debug!(device_id = self.device_id, "negotiated session key");
                        Some(key)
                    }
                    Err(err) => {
                        tracing::warn!(?err, "session key exchange failed; using default key");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn negotiate_session_key(&self) -> anyhow::Result<String> {
        let payload = crypto::build_key_request(self.device_id);
        let url = self.endpoint(&["v1", "session"])?;
        let resp = self
            .client
            .post(url.clone())
            .json(&SessionRequest {
                version: KEY_EXCHANGE_VERSION,
                device_id: self.device_id,
                payload: &payload,
            })
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("session key request failed ({status}): {body}");
        }
        let session: SessionResponse = resp.json().await.context("parse session response")?;
        let key = crypto::derive_session_key(&session.key_blob).context("derive session key")?;
        Ok(key)
    }
}

#[async_trait]
impl ContentSource for ProtectedHttpSource {
    fn name(&self) -> &'static str {
        "protected"
    }

    async fn fetch_toc(&self, work_id: &str) -> anyhow::Result<TocListing> {
        let url = self.endpoint(&["v1", "books", work_id, "catalog"])?;
        super::get_json(&self.client, url.as_str())
            .await
            .context("fetch catalog")
    }

    async fn fetch_chapter(
        &self,
        work_id: &str,
        chapter: &TocChapter,
    ) -> anyhow::Result<ChapterPayload> {
        let content_key = self.session_key().await;
        let url = self.endpoint(&["v1", "books", work_id, "chapters", &chapter.id])?;
        let resp: ChapterResponse = super::get_json(&self.client, url.as_str())
            .await
            .with_context(|| format!("fetch chapter: {}", chapter.id))?;
        Ok(ChapterPayload {
            body: ChapterBody::Encrypted {
                data: resp.content,
                content_key,
            },
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
