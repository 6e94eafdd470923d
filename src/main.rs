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
    draftsync::logging::init("info").context("init logging")?;

    let cli = draftsync::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let config = draftsync::config::EngineConfig::load(cli.config.as_deref()).context("load config")?;

    match cli.command {
        draftsync::cli::Command::Repair(args) => {
            draftsync::commands::repair(args, &config).context("repair")?;
        }
        draftsync::cli::Command::Outline(args) => {
            draftsync::commands::outline(args, &config).context("outline")?;
        }
        draftsync::cli::Command::Replay(args) => {
            draftsync::commands::replay(args, config).await.context("replay")?;
        }
        draftsync::cli::Command::Generate(args) => {
            draftsync::commands::generate(args, config)
                .await
                .context("generate")?;
        }
        draftsync::cli::Command::Paginate(args) => {
            draftsync::commands::paginate_command(args, &config).context("paginate")?;
        }
        draftsync::cli::Command::Export(args) => {
            draftsync::commands::export(args, &config)
                .await
                .context("export")?;
        }
    }

    Ok(())
}
