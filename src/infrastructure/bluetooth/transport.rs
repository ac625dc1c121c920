//! Transport Seam
//!
//! The platform BLE stack sits behind [`VehicleTransport`] so the pairing and
//! messaging logic can run against any backend.

use crate::infrastructure::bluetooth::advertisement::RawAdvertisement;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Device {0:#X} not found")]
    NotFound(u64),

    #[error("Service {0} unavailable")]
    ServiceUnavailable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Bluetooth error: {0}")]
    Platform(String),
}

/// Outcome of a pairing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    Paired,
    AlreadyPaired,
    Rejected,
    Failed,
}

impl PairingStatus {
    pub fn is_paired(self) -> bool {
        matches!(self, Self::Paired | Self::AlreadyPaired)
    }
}

/// Outcome of an unpairing request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpairingStatus {
    Unpaired,
    AlreadyUnpaired,
    Failed,
}

/// Link state reported after trying to open the vehicle service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

#[async_trait]
pub trait VehicleTransport: Send + Sync {
    /// Whether the OS already holds a pairing for this address
    async fn is_paired(&self, mac_address: u64) -> Result<bool, TransportError>;

    /// Pair with "confirm only" protection, accepting any confirmation prompt
    async fn pair(&self, mac_address: u64) -> Result<PairingStatus, TransportError>;

    async fn unpair(&self, mac_address: u64) -> Result<UnpairingStatus, TransportError>;

    /// Open the vehicle's primary service
    async fn open_service(
        &self,
        mac_address: u64,
        service_uuid: &str,
    ) -> Result<LinkStatus, TransportError>;

    /// Forward every notification on `char_uuid` to `sink`
    async fn subscribe(
        &self,
        mac_address: u64,
        char_uuid: &str,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<(), TransportError>;

    async fn write(
        &self,
        mac_address: u64,
        char_uuid: &str,
        bytes: &[u8],
    ) -> Result<(), TransportError>;
}

/// Platform advertisement watcher
pub trait AdvertisementSource: Send {
    /// Start delivering advertisements into `sink`
    fn start(&mut self, sink: mpsc::UnboundedSender<RawAdvertisement>) -> anyhow::Result<()>;

    fn stop(&mut self) -> anyhow::Result<()>;

    fn is_running(&self) -> bool;
}
