//! Vehicle Service Module
//!
//! Main service that coordinates scanning, the vehicle registry, pairing and
//! response dispatch.

use crate::domain::models::{AppEvent, VehicleRecord};
use crate::domain::registry::VehicleRegistry;
use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::{
    connection::{CancelToken, PairingConnectionManager, SessionError, SessionOutcome},
    dispatcher::{ChannelObserver, DispatchStats, LoggingObserver, ResponseDispatcher},
    protocol::VehicleCommand,
    scanner::BleScanner,
    transport::{AdvertisementSource, VehicleTransport},
};
use anyhow::Result;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::info;

/// Main service coordinating all vehicle BLE operations
pub struct VehicleService {
    registry: VehicleRegistry,
    scanner: BleScanner,
    manager: Arc<PairingConnectionManager>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl VehicleService {
    pub fn new(
        transport: Arc<dyn VehicleTransport>,
        source: Box<dyn AdvertisementSource>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        settings: Arc<Mutex<SettingsService>>,
    ) -> Result<Self> {
        let (config, scan_options) = {
            let settings = settings
                .lock()
                .map_err(|_| anyhow::anyhow!("Lock error"))?;
            let s = settings.get();
            (s.connection_config(), s.scan_options())
        };

        let registry = VehicleRegistry::new();
        let scanner = BleScanner::new(
            source,
            registry.clone(),
            event_sender.clone(),
            scan_options,
        );
        let manager = Arc::new(PairingConnectionManager::new(
            transport,
            config,
            event_sender.clone(),
        ));

        Ok(Self {
            registry,
            scanner,
            manager,
            event_sender,
        })
    }

    /// Start scanning for vehicles
    pub fn start_scan(&mut self) -> Result<()> {
        self.scanner.start()
    }

    /// Stop scanning and wait for queued advertisements to be processed
    pub async fn stop_scan(&mut self) -> Result<usize> {
        self.scanner.stop_and_drain().await
    }

    /// Qualifying vehicles in discovery order
    pub fn vehicles(&self) -> Vec<VehicleRecord> {
        self.registry.qualifying()
    }

    pub fn registry(&self) -> &VehicleRegistry {
        &self.registry
    }

    /// Handle for sending commands from inside a session
    pub fn commander(&self, mac_address: u64) -> VehicleCommander {
        VehicleCommander {
            mac_address,
            manager: self.manager.clone(),
        }
    }

    /// Pair, connect and run `communicate` against one vehicle.
    ///
    /// Responses are dispatched to the log and the event channel for the
    /// lifetime of the session.
    pub async fn run_session<F, Fut>(
        &self,
        mac_address: u64,
        cancel: &CancelToken,
        communicate: F,
    ) -> (SessionOutcome, DispatchStats)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let stop_dispatch = CancelToken::new();
        let dispatch = ResponseDispatcher::new()
            .with_observer(LoggingObserver)
            .with_observer(ChannelObserver::new(self.event_sender.clone()))
            .spawn(frame_rx, stop_dispatch.clone());

        let outcome = self
            .manager
            .run_session(mac_address, frame_tx, cancel, communicate)
            .await;
        info!("Session with {:#X} ended: {:?}", mac_address, outcome);

        // The transport may still hold a sender for the notification handler
        stop_dispatch.cancel();
        let stats = dispatch.await.unwrap_or_default();
        (outcome, stats)
    }
}

/// Sends commands to one connected vehicle
#[derive(Clone)]
pub struct VehicleCommander {
    mac_address: u64,
    manager: Arc<PairingConnectionManager>,
}

impl VehicleCommander {
    pub async fn send(&self, command: VehicleCommand) -> Result<(), SessionError> {
        self.manager.send(self.mac_address, &command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ConnectionState;
    use crate::infrastructure::bluetooth::advertisement::RawAdvertisement;
    use crate::infrastructure::bluetooth::protocol::TypedResponse;
    use crate::infrastructure::bluetooth::transport::mock::{MockSource, MockTransport};

    fn settings() -> Arc<Mutex<SettingsService>> {
        let path = std::env::temp_dir().join("anki_vehicle_tool_service_test_missing.json");
        Arc::new(Mutex::new(SettingsService::with_path(path)))
    }

    #[tokio::test]
    async fn test_scan_then_session() {
        let vehicle = RawAdvertisement {
            mac_address: 0x42,
            rssi: -40,
            local_name: None,
            data_sections: vec![vec![], vec![], vec![0xBE, 0xEF, 0, 10, 0, 0, 0, 1]],
            manufacturer_data: Vec::new(),
        };
        let source = MockSource {
            advertisements: vec![vehicle],
            sink: None,
        };
        let transport = Arc::new(MockTransport {
            reply: Some(vec![0x03, 0x1b, 0x20, 0x0f]),
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut service =
            VehicleService::new(transport.clone(), Box::new(source), tx, settings()).unwrap();
        service.start_scan().unwrap();
        assert_eq!(service.stop_scan().await.unwrap(), 1);

        let vehicles = service.vehicles();
        assert_eq!(vehicles.len(), 1);
        let mac = vehicles[0].mac_address;

        let commander = service.commander(mac);
        let (outcome, stats) = service
            .run_session(mac, &CancelToken::new(), move || async move {
                commander.send(VehicleCommand::BatteryRequest).await?;
                Ok(())
            })
            .await;

        assert_eq!(outcome, SessionOutcome::Completed);
        assert_eq!(stats.frames, 1);
        assert_eq!(transport.written.lock().unwrap()[0], vec![0x01, 0x1a]);

        let mut battery = None;
        let mut final_state = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                AppEvent::Response(response) => battery = Some(response),
                AppEvent::ConnectionState { state, .. } => final_state = Some(state),
                _ => {}
            }
        }
        assert_eq!(battery, Some(TypedResponse::BatteryLevel(0x0f20)));
        assert_eq!(final_state, Some(ConnectionState::Unpaired));
    }
}
