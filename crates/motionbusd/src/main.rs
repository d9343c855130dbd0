//! motionbusd — Motionbus host daemon.
//!
//! `motionbusd` runs the transport and channel scheduler against the firmware.
//! `motionbusd flash <image>` streams a firmware image instead and exits.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use motionbus_core::config::MotionbusConfig;
use motionbus_services::{ChannelStore, ControlHandle, FileResolver, FirmwareExecutor, SchedulerSettings};

mod bus;
mod model;
mod runloop;
mod transport;

use bus::LinuxBus;
use model::ObjectModel;
use runloop::RunLoop;
use transport::{TransferOutcome, Transport, TransportSettings};

const CONNECT_ATTEMPTS: u32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = MotionbusConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MotionbusConfig::load().context("failed to load config")?;

    let bus = LinuxBus::open(&config.bus).with_context(|| {
        format!("failed to open bus on {}", config.bus.spi_device.display())
    })?;
    let transport = Transport::new(bus, TransportSettings::from(&config));
    tracing::info!(
        device = %config.bus.spi_device.display(),
        ready_pin = config.bus.transfer_ready_pin,
        "bus ready"
    );

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("flash") => {
            let image = args.next().context("usage: motionbusd flash <image>")?;
            flash(transport, Path::new(&image)).await
        }
        Some(other) => anyhow::bail!("unknown command: {other}"),
        None => serve(transport, &config).await,
    }
}

async fn serve(transport: Transport<LinuxBus>, config: &MotionbusConfig) -> Result<()> {
    let store = Arc::new(ChannelStore::new(
        SchedulerSettings::from(&config.channels),
        Arc::new(FirmwareExecutor),
        FileResolver::new(config.files.base_directory.clone()),
    ));
    let control = ControlHandle::new(store);
    let model = ObjectModel::shared();

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── HTTP API ─────────────────────────────────────────────────────────────
    if config.api.port != 0 {
        let state = motionbus_api::ApiState {
            control: control.clone(),
            shutdown_tx: shutdown_tx.clone(),
        };
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = motionbus_api::serve(state, port).await {
                tracing::error!(error = %e, "API server failed");
            }
        });
    }

    tracing::info!(
        base_directory = %config.files.base_directory.display(),
        poll_delay_ms = config.transport.poll_delay_ms,
        "motionbusd starting"
    );

    RunLoop::new(
        transport,
        control,
        model,
        config.transport.poll_delay(),
        shutdown_rx,
    )
    .run()
    .await
    .context("transport failed")
}

async fn flash(mut transport: Transport<LinuxBus>, image: &Path) -> Result<()> {
    let data = tokio::fs::read(image)
        .await
        .with_context(|| format!("failed to read {}", image.display()))?;

    // The firmware only accepts IAP from an established link.
    let mut attempts = 0;
    while transport.perform_full_transfer().await? != TransferOutcome::Completed {
        attempts += 1;
        if attempts == CONNECT_ATTEMPTS {
            anyhow::bail!("firmware did not answer after {attempts} transfers");
        }
    }

    tracing::info!(image = %image.display(), bytes = data.len(), "flashing firmware");
    transport
        .flash_firmware(&data)
        .await
        .context("firmware update failed")?;
    tracing::info!("firmware update complete");
    Ok(())
}
