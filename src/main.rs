use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use color_eyre::eyre::{bail, WrapErr};
use gpio_buttons::rpi::RpiGpio;
use gpio_buttons::{ButtonConfig, ButtonManager, ButtonSettings};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gpio_buttons=debug".parse()?)
                .add_directive("gpio_buttons_demo=debug".parse()?),
        )
        .init();

    let path = PathBuf::from(
        std::env::args()
            .nth(1)
            .unwrap_or_else(|| "buttons.json".to_owned()),
    );
    let settings = std::fs::read(&path)
        .wrap_err_with(|| format!("could not read {}", path.display()))?;
    let settings: Vec<ButtonSettings> = serde_json::from_slice(&settings)
        .wrap_err_with(|| format!("could not parse {}", path.display()))?;

    let mut manager = ButtonManager::new(RpiGpio::new()?);
    for settings in settings {
        let presses = Arc::new(AtomicUsize::new(0));
        let pin = settings.pin.clone();
        let config = ButtonConfig::from_settings(settings, move |pin| {
            let count = presses.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::info!(%pin, count, "button pressed");
        });
        if let Err(error) = manager.register_button(config) {
            tracing::warn!(%pin, ?error, "skipping button");
        }
    }
    if manager.button_count() == 0 {
        bail!("no buttons could be configured, check the pin names in {}", path.display());
    }

    manager.start()?;
    tracing::info!(buttons = manager.button_count(), "press ctrl-c or send SIGTERM to exit");

    shutdown_signal().await?;
    println!("Stopping");
    manager.stop().await;
    Ok(())
}

async fn shutdown_signal() -> color_eyre::Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).wrap_err("could not listen for SIGTERM")?;
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            if let Err(sigint_error) = interrupted {
                tracing::error!(?sigint_error, "could not listen for ctrl-c");
            }
        }
        _ = terminate.recv() => tracing::info!("received SIGTERM"),
    }
    Ok(())
}
