use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    novelsync::logging::init().context("init logging")?;

    let cli = novelsync::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        novelsync::cli::Command::Sync(args) => {
            novelsync::commands::sync(args).await.context("sync")?;
        }
        novelsync::cli::Command::Cache {
            command: novelsync::cli::CacheCommand::Status(args),
        } => {
            novelsync::commands::cache_status(args)
                .await
                .context("cache status")?;
        }
        novelsync::cli::Command::Cache {
            command: novelsync::cli::CacheCommand::Clear(args),
        } => {
            novelsync::commands::cache_clear(args)
                .await
                .context("cache clear")?;
        }
    }

    Ok(())
}
