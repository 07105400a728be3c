use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::DecryptError;
use crate::formats::{TocChapter, TocListing};

pub mod plain;
pub mod protected;

/// Chapter body as delivered by a source, before decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterBody {
    Plain(String),
    Encrypted {
        data: String,
        /// Session content key; `None` means the default key.
        content_key: Option<String>,
    },
}

impl ChapterBody {
    pub fn into_html(self) -> Result<String, DecryptError> {
        match self {
            Self::Plain(html) => Ok(html),
            Self::Encrypted { data, content_key } => {
                crate::crypto::decrypt(&data, content_key.as_deref())
            }
        }
    }
}

/// An image that a source reports outside the chapter markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteImage {
    pub url: String,
    /// Number of top-level text blocks preceding the image.
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterPayload {
    pub body: ChapterBody,
    pub images: Vec<RemoteImage>,
}

/// The capabilities the sync pipeline needs from a remote source.
#[async_trait]
pub trait ContentSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_toc(&self, work_id: &str) -> anyhow::Result<TocListing>;

    async fn fetch_chapter(
        &self,
        work_id: &str,
        chapter: &TocChapter,
    ) -> anyhow::Result<ChapterPayload>;

    async fn fetch_image(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

pub(crate) fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context as _;

    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent(concat!("novelsync/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build http client")
}

pub(crate) async fn get_bytes(client: &reqwest::Client, url: &str) -> anyhow::Result<Vec<u8>> {
    use anyhow::Context as _;

    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("GET {url} failed ({status}): {body}");
    }
    let bytes = resp
        .bytes()
        .await
        .with_context(|| format!("read body: {url}"))?;
    Ok(bytes.to_vec())
}

pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
) -> anyhow::Result<T> {
    use anyhow::Context as _;

    let bytes = get_bytes(client, url).await?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse json: {url}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_body_passes_through() -> anyhow::Result<()> {
        let body = ChapterBody::Plain("<p>x</p>".to_owned());
        assert_eq!(body.into_html()?, "<p>x</p>");
        Ok(())
    }

    #[test]
    fn encrypted_body_is_decrypted_with_its_key() -> anyhow::Result<()> {
        let key = "0F0E0D0C0B0A09080706050403020100";
        let data = crate::crypto::encrypt(b"<p>secret</p>", Some(key))?;
        let body = ChapterBody::Encrypted {
            data,
            content_key: Some(key.to_owned()),
        };
        assert_eq!(body.into_html()?, "<p>secret</p>");
        Ok(())
    }

    #[test]
    fn encrypted_body_with_wrong_key_is_a_decrypt_error() -> anyhow::Result<()> {
        let data = crate::crypto::encrypt(b"<p>secret</p>", None)?;
        let body = ChapterBody::Encrypted {
            data,
            content_key: Some("0F0E0D0C0B0A09080706050403020100".to_owned()),
        };
        assert!(!matches!(body.into_html(), Ok(ref html) if html == "<p>secret</p>"));
        Ok(())
    }
}
