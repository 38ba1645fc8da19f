//! ForgeShell - remote command execution over line-delimited JSON on stdio

mod protocol;
mod server;

use anyhow::Context;
use clap::Parser;
use forgeshell_foundation::{ConfigLoader, ShellType};
use forgeshell_task::ExecutionOrchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ForgeShell - execute, poll and terminate shell commands
#[derive(Parser, Debug)]
#[command(name = "forgeshell")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file to use instead of the layered .forgeshell files
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory whose .forgeshell settings are loaded
    #[arg(short = 'C', long)]
    working_dir: Option<PathBuf>,

    /// Shell to run commands with (bash, sh, pwsh, powershell)
    #[arg(long)]
    shell: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout은 프로토콜 전용이므로 로그는 stderr로
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => ConfigLoader::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let working_dir = match args.working_dir {
                Some(dir) => dir,
                None => std::env::current_dir().context("cannot determine working directory")?,
            };
            ConfigLoader::new(&working_dir).load_all()?
        }
    };

    if let Some(name) = &args.shell {
        let shell = ShellType::parse(name)
            .with_context(|| format!("unknown shell '{}'", name))?;
        config.shell = Some(shell);
    }

    let orchestrator = Arc::new(ExecutionOrchestrator::new(config)?);
    tracing::info!("ForgeShell {} listening on stdio", env!("CARGO_PKG_VERSION"));

    let stdio = server::serve(Arc::clone(&orchestrator), tokio::io::stdin(), tokio::io::stdout());
    tokio::select! {
        result = stdio => {
            result.context("stdio transport failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, terminating background tasks");
            orchestrator.shutdown().await;
        }
    }

    Ok(())
}
