use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset: pipeline progress at info, HTTP internals quiet.
const DEFAULT_DIRECTIVES: &str = "info,hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn";

pub fn init() -> anyhow::Result<()> {
    let raw = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(raw.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}

fn build_filter(raw: Option<&str>) -> anyhow::Result<EnvFilter> {
    match raw.map(str::trim).filter(|r| !r.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("parse {}={directives:?}", EnvFilter::DEFAULT_ENV)),
        None => EnvFilter::try_new(DEFAULT_DIRECTIVES).context("build default log filter"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_applies_when_unset_or_blank() -> anyhow::Result<()> {
        assert!(build_filter(None)?.to_string().contains("reqwest=warn"));
        assert!(build_filter(Some("  "))?.to_string().contains("hyper=warn"));
        Ok(())
    }

    #[test]
    fn explicit_directives_win() -> anyhow::Result<()> {
        let filter = build_filter(Some("novelsync=debug"))?;
        assert!(filter.to_string().contains("novelsync=debug"));
        Ok(())
    }
}
