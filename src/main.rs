mod domain;
mod infrastructure;
mod presentation;

use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::transport::{AdvertisementSource, VehicleTransport};
use crate::infrastructure::bluetooth::VehicleService;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[cfg(windows)]
fn platform_transport() -> anyhow::Result<(Arc<dyn VehicleTransport>, Box<dyn AdvertisementSource>)>
{
    use crate::infrastructure::bluetooth::winrt::{WinRtAdvertisementSource, WinRtTransport};

    Ok((
        Arc::new(WinRtTransport::new()),
        Box::new(WinRtAdvertisementSource::new()),
    ))
}

#[cfg(not(windows))]
fn platform_transport() -> anyhow::Result<(Arc<dyn VehicleTransport>, Box<dyn AdvertisementSource>)>
{
    anyhow::bail!("No BLE transport is available on this platform")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;

    let _logging_guard =
        crate::infrastructure::logging::init_logger(&settings_service.get().log_settings)
            .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
            .ok();

    tracing::info!("Starting Anki Vehicle Tool");

    let settings = Arc::new(Mutex::new(settings_service));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (transport, source) = platform_transport()?;
    let service = VehicleService::new(transport, source, event_tx, settings)?;

    let result = presentation::console::run(service, event_rx).await;
    if let Err(e) = &result {
        tracing::error!("Console exited with error: {:#}", e);
    }
    result
}
