//! BLE Scanner Module
//!
//! Feeds platform advertisements through the decoder into the vehicle registry.

use crate::domain::models::{format_mac, AppEvent};
use crate::domain::registry::VehicleRegistry;
use crate::infrastructure::bluetooth::advertisement::{self, RawAdvertisement};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::AdvertisementSource;
use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Diagnostic output options for discovered vehicles
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    pub show_details: bool,
    pub show_raw_bytes: bool,
}

/// Decode one advertisement and merge it into the registry.
///
/// Announces the vehicle on `events` the first time a qualifying device is seen.
pub fn ingest(
    registry: &VehicleRegistry,
    adv: &RawAdvertisement,
    options: ScanOptions,
    events: &mpsc::UnboundedSender<AppEvent>,
) -> bool {
    let diff = advertisement::decode_advertisement(adv);
    trace!(
        "Advertisement from {} rssi {} name [{}] ({} data sections)",
        format_mac(adv.mac_address),
        adv.rssi,
        adv.local_name
            .as_deref()
            .map(protocol::hex_string)
            .unwrap_or_default(),
        adv.data_sections.len()
    );

    let outcome = registry.upsert(&diff);
    if !outcome.qualifying_new {
        return false;
    }

    if options.show_details {
        info!(
            "{}",
            advertisement::describe(adv, &diff, options.show_raw_bytes)
        );
    }
    if let Some(record) = registry.get(adv.mac_address) {
        debug!(
            "Found vehicle {} ({})",
            record.display_model(),
            format_mac(record.mac_address)
        );
        let _ = events.send(AppEvent::VehicleFound(record));
    }
    true
}

/// BLE Scanner for discovering vehicles
pub struct BleScanner {
    source: Box<dyn AdvertisementSource>,
    registry: VehicleRegistry,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    options: ScanOptions,
    ingest_task: Option<JoinHandle<usize>>,
}

impl BleScanner {
    pub fn new(
        source: Box<dyn AdvertisementSource>,
        registry: VehicleRegistry,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        options: ScanOptions,
    ) -> Self {
        Self {
            source,
            registry,
            event_sender,
            options,
            ingest_task: None,
        }
    }

    /// Start scanning. Advertisements are processed on a dedicated task.
    pub fn start(&mut self) -> Result<()> {
        // Stop any existing scan
        self.stop()?;

        info!("Starting BLE scan for vehicles");

        let (tx, mut rx) = mpsc::unbounded_channel::<RawAdvertisement>();
        let registry = self.registry.clone();
        let events = self.event_sender.clone();
        let options = self.options;

        self.ingest_task = Some(tokio::spawn(async move {
            let mut found = 0;
            while let Some(adv) = rx.recv().await {
                if ingest(&registry, &adv, options, &events) {
                    found += 1;
                }
            }
            found
        }));

        self.source.start(tx)
    }

    /// Stop scanning. Returns how many vehicles this scan discovered.
    pub async fn stop_and_drain(&mut self) -> Result<usize> {
        self.stop()?;
        match self.ingest_task.take() {
            Some(task) => Ok(task.await?),
            None => Ok(0),
        }
    }

    /// Stop scanning
    pub fn stop(&mut self) -> Result<()> {
        if self.source.is_running() {
            info!("Stopping BLE scan...");
            self.source.stop()?;
        }
        Ok(())
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.source.is_running()
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
