mod annotations;
mod config;
mod plugin;

use anyhow::Result;
use clap::Parser;
use nri_stub::Stub;
use nri_stub::StubConfig;
use tokio_util::sync::CancellationToken;
use utils::version;

use crate::config::Cli;
use crate::plugin::CoreBindingPlugin;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

/// Cancel `cancel` on SIGTERM or SIGINT.
fn spawn_signal_handler(cancel: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }
        cancel.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = utils::logging::init(cli.log_file.as_deref())?;

    tracing::info!("Starting NRI core-binding plugin {}", &**version::VERSION);

    let stub = Stub::connect(StubConfig::from(&cli)).await.map_err(|e| {
        tracing::error!("Failed to create NRI plugin stub: {e:?}");
        anyhow::anyhow!("Failed to create NRI plugin stub: {e:?}")
    })?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    stub.run(CoreBindingPlugin, cancel).await.map_err(|e| {
        tracing::error!("Plugin exited: {e:?}");
        anyhow::anyhow!("Plugin exited: {e:?}")
    })?;

    tracing::info!("Plugin stopped");
    Ok(())
}
