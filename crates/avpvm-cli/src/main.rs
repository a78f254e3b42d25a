//! avpvm - Run Apple Virtualization research VMs.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use avpvm_core::{LifecycleController, Settings, VmEvent, VmRuntime};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod args;

use args::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("failed to load settings")?;

    let filter = if cli.debug {
        "debug".to_string()
    } else {
        settings.logging.level.clone()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut params = settings.vm;
    cli.apply(&mut params);

    let controller = LifecycleController::new(runtime()?);
    let record = controller
        .configure(params)
        .context("invalid virtual machine configuration")?;

    let identity = record.identity();
    println!("Board ID: {:#x}", identity.board_id());
    println!("Chip ID:  {:#018x}", identity.chip_id());
    if identity.is_generated_chip_id() && record.has_persistent_state() {
        println!("Pass --chip-id {:#x} to boot this storage again.", identity.chip_id());
    }

    let mut events = controller.subscribe();

    // Ctrl-C during the start sequence is remembered and applied once the
    // machine is up.
    let start = controller.start();
    tokio::pin!(start);
    loop {
        tokio::select! {
            result = &mut start => {
                result.context("failed to start virtual machine")?;
                break;
            }
            result = signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                tracing::info!("Interrupted during start, will stop once running");
                controller.stop_by_user_request();
            }
        }
    }
    tracing::info!(state = %controller.state(), "Virtual machine started, press Ctrl-C to stop");

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                tracing::info!("Stopping virtual machine");
                controller.stop_by_user_request();
            }
            event = events.recv() => match event {
                Ok(VmEvent::Stopped { reason }) => {
                    tracing::info!(?reason, "Virtual machine stopped");
                    return Ok(());
                }
                Ok(VmEvent::Failed { diagnostic }) => {
                    bail!("virtual machine failed: {diagnostic}");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed lifecycle events");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

#[cfg(target_os = "macos")]
fn runtime() -> Result<Arc<dyn VmRuntime>> {
    if !avpvm_vz::is_supported() {
        bail!("Virtualization.framework is not available on this host");
    }
    Ok(Arc::new(avpvm_vz::VzRuntime::new()))
}

#[cfg(not(target_os = "macos"))]
fn runtime() -> Result<Arc<dyn VmRuntime>> {
    bail!("avpvm requires macOS on Apple silicon")
}
