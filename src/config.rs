use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;

use crate::source::ContentSource;
use crate::source::plain::PlainHttpSource;
use crate::source::protected::ProtectedHttpSource;

pub const CACHE_DIR_ENV: &str = "NOVELSYNC_CACHE_DIR";
pub const SOURCE_ENV: &str = "NOVELSYNC_SOURCE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Plain,
    Protected,
}

impl SourceKind {
    pub fn from_env() -> anyhow::Result<Self> {
        let raw = std::env::var(SOURCE_ENV).unwrap_or_else(|_| "plain".to_string());
        Self::parse(&raw).with_context(|| {
            format!("invalid {SOURCE_ENV}={raw:?}. expected one of: plain, protected")
        })
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "plain" => Ok(Self::Plain),
            "protected" | "encrypted" => Ok(Self::Protected),
            other => anyhow::bail!("unsupported source: {other}"),
        }
    }

    pub fn connect(self, base_url: &str) -> anyhow::Result<Arc<dyn ContentSource>> {
        let source: Arc<dyn ContentSource> = match self {
            Self::Plain => Arc::new(PlainHttpSource::new(base_url)?),
            Self::Protected => Arc::new(ProtectedHttpSource::new(base_url)?),
        };
        Ok(source)
    }
}

/// Resolves the scratch root: explicit value, then `NOVELSYNC_CACHE_DIR`, then
/// a directory under the system temp dir.
pub fn resolve_cache_dir(explicit: Option<&str>) -> PathBuf {
    if let Some(dir) = explicit.map(str::trim).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    match std::env::var(CACHE_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => std::env::temp_dir().join("novelsync-cache"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_parse_is_case_insensitive() -> anyhow::Result<()> {
        assert_eq!(SourceKind::parse("plain")?, SourceKind::Plain);
        assert_eq!(SourceKind::parse("PROTECTED")?, SourceKind::Protected);
        assert_eq!(SourceKind::parse("")?, SourceKind::Plain);
        assert!(SourceKind::parse("ftp").is_err());
        Ok(())
    }

    #[test]
    fn explicit_cache_dir_wins() {
        assert_eq!(resolve_cache_dir(Some(" /tmp/x ")), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn connect_rejects_invalid_base_url() {
        assert!(SourceKind::Plain.connect("not a url").is_err());
        assert!(SourceKind::Protected.connect("http://127.0.0.1:1/").is_ok());
    }
}
