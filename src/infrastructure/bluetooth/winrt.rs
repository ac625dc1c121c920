//! WinRT Transport
//!
//! [`VehicleTransport`] and [`AdvertisementSource`] on top of the Windows
//! Bluetooth LE APIs.

use crate::infrastructure::bluetooth::advertisement::RawAdvertisement;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    AdvertisementSource, LinkStatus, PairingStatus, TransportError, UnpairingStatus,
    VehicleTransport,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Devices::Enumeration::{
    DeviceInformationCustomPairing, DevicePairingKinds, DevicePairingProtectionLevel,
    DevicePairingRequestedEventArgs, DevicePairingResultStatus, DeviceUnpairingResultStatus,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

impl From<windows::core::Error> for TransportError {
    fn from(e: windows::core::Error) -> Self {
        TransportError::Platform(e.message().to_string())
    }
}

fn parse_guid(uuid_str: &str) -> Result<GUID, TransportError> {
    let parts = protocol::parse_uuid(uuid_str)
        .map_err(|e| TransportError::Platform(format!("{}: {}", uuid_str, e)))?;
    Ok(GUID {
        data1: parts.data1,
        data2: parts.data2,
        data3: parts.data3,
        data4: parts.data4,
    })
}

/// Remove every entry keyed to `mac_address`
fn take_for_device<K: Clone + Eq + Hash, V>(
    map: &mut HashMap<(u64, K), V>,
    mac_address: u64,
) -> Vec<V> {
    let keys: Vec<(u64, K)> = map
        .keys()
        .filter(|(mac, _)| *mac == mac_address)
        .map(|key| (key.0, key.1.clone()))
        .collect();
    keys.iter().filter_map(|key| map.remove(key)).collect()
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

/// GATT-backed transport. Devices and characteristics are cached per address.
#[derive(Default)]
pub struct WinRtTransport {
    devices: Mutex<HashMap<u64, BluetoothLEDevice>>,
    characteristics: Mutex<HashMap<(u64, GUID), GattCharacteristic>>,
    // ValueChanged registrations, removed when the device is forgotten
    subscriptions: Mutex<HashMap<(u64, GUID), (GattCharacteristic, i64)>>,
}

impl WinRtTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn device(&self, mac_address: u64) -> Result<BluetoothLEDevice, TransportError> {
        if let Some(device) = self
            .devices
            .lock()
            .ok()
            .and_then(|devices| devices.get(&mac_address).cloned())
        {
            return Ok(device);
        }

        let device = BluetoothLEDevice::FromBluetoothAddressAsync(mac_address)?
            .await
            .map_err(|_| TransportError::NotFound(mac_address))?;
        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(mac_address, device.clone());
        }
        Ok(device)
    }

    fn characteristic(
        &self,
        mac_address: u64,
        char_uuid: &str,
    ) -> Result<GattCharacteristic, TransportError> {
        let uuid = parse_guid(char_uuid)?;
        self.characteristics
            .lock()
            .ok()
            .and_then(|chars| chars.get(&(mac_address, uuid)).cloned())
            .ok_or_else(|| TransportError::Platform(format!("Characteristic {} not found", char_uuid)))
    }

    fn remove_subscription(&self, key: (u64, GUID)) {
        let previous = self
            .subscriptions
            .lock()
            .ok()
            .and_then(|mut subs| subs.remove(&key));
        if let Some((characteristic, token)) = previous {
            let _ = characteristic.RemoveValueChanged(token);
        }
    }

    fn forget(&self, mac_address: u64) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            for (characteristic, token) in take_for_device(&mut subs, mac_address) {
                let _ = characteristic.RemoveValueChanged(token);
            }
        }
        if let Ok(mut chars) = self.characteristics.lock() {
            take_for_device(&mut chars, mac_address);
        }
        if let Ok(mut devices) = self.devices.lock() {
            if let Some(device) = devices.remove(&mac_address) {
                let _ = device.Close();
            }
        }
    }
}

#[async_trait]
impl VehicleTransport for WinRtTransport {
    async fn is_paired(&self, mac_address: u64) -> Result<bool, TransportError> {
        let device = self.device(mac_address).await?;
        let is_paired = device.DeviceInformation()?.Pairing()?.IsPaired()?;
        debug!("Device pairing status - IsPaired: {}", is_paired);
        Ok(is_paired)
    }

    async fn pair(&self, mac_address: u64) -> Result<PairingStatus, TransportError> {
        let device = self.device(mac_address).await?;
        let custom = device.DeviceInformation()?.Pairing()?.Custom()?;

        // Confirm-only pairing: every prompt is accepted
        let token = {
            let handler = TypedEventHandler::new(
                move |_: windows::core::Ref<DeviceInformationCustomPairing>,
                      args: windows::core::Ref<DevicePairingRequestedEventArgs>| {
                    if let Some(args) = args.as_ref() {
                        args.Accept()?;
                    }
                    Ok(())
                },
            );
            custom.PairingRequested(&handler)?
        };
        let result = custom
            .PairWithProtectionLevelAsync(
                DevicePairingKinds::ConfirmOnly,
                DevicePairingProtectionLevel::None,
            )?
            .await;
        let _ = custom.RemovePairingRequested(token);

        let status = result?.Status()?;
        info!("Pairing result: {:?}", status);
        Ok(match status {
            DevicePairingResultStatus::Paired => PairingStatus::Paired,
            DevicePairingResultStatus::AlreadyPaired => PairingStatus::AlreadyPaired,
            DevicePairingResultStatus::RejectedByHandler
            | DevicePairingResultStatus::PairingCanceled => PairingStatus::Rejected,
            _ => PairingStatus::Failed,
        })
    }

    async fn unpair(&self, mac_address: u64) -> Result<UnpairingStatus, TransportError> {
        let device = self.device(mac_address).await?;
        let result = device
            .DeviceInformation()?
            .Pairing()?
            .UnpairAsync()?
            .await?;
        self.forget(mac_address);

        let status = result.Status()?;
        info!("Unpairing result: {:?}", status);
        Ok(match status {
            DeviceUnpairingResultStatus::Unpaired => UnpairingStatus::Unpaired,
            DeviceUnpairingResultStatus::AlreadyUnpaired => UnpairingStatus::AlreadyUnpaired,
            _ => UnpairingStatus::Failed,
        })
    }

    async fn open_service(
        &self,
        mac_address: u64,
        service_uuid: &str,
    ) -> Result<LinkStatus, TransportError> {
        let device = self.device(mac_address).await?;
        let uuid = parse_guid(service_uuid)?;

        let services_result = device.GetGattServicesForUuidAsync(uuid)?.await?;
        if services_result.Status()? != GattCommunicationStatus::Success {
            return Err(TransportError::ServiceUnavailable(service_uuid.to_string()));
        }
        // Drop the service list before the next await
        let service = {
            let services = services_result.Services()?;
            if services.Size()? == 0 {
                return Err(TransportError::ServiceUnavailable(service_uuid.to_string()));
            }
            services.GetAt(0)?
        };

        if device.ConnectionStatus()? != BluetoothConnectionStatus::Connected {
            return Ok(LinkStatus::Disconnected);
        }

        let chars_result = service.GetCharacteristicsAsync()?.await?;
        if chars_result.Status()? != GattCommunicationStatus::Success {
            return Err(TransportError::Platform(
                "Failed to get characteristics".to_string(),
            ));
        }

        let characteristics = chars_result.Characteristics()?;
        debug!("Found {} characteristics", characteristics.Size()?);
        if let Ok(mut cache) = self.characteristics.lock() {
            for i in 0..characteristics.Size()? {
                let c = characteristics.GetAt(i)?;
                cache.insert((mac_address, c.Uuid()?), c);
            }
        }

        Ok(LinkStatus::Connected)
    }

    async fn subscribe(
        &self,
        mac_address: u64,
        char_uuid: &str,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(mac_address, char_uuid)?;
        let key = (mac_address, parse_guid(char_uuid)?);
        self.remove_subscription(key);

        let token = {
            let handler = TypedEventHandler::new(
                move |_: windows::core::Ref<GattCharacteristic>,
                      args: windows::core::Ref<GattValueChangedEventArgs>| {
                    if let Some(args) = args.as_ref() {
                        let bytes = read_buffer(&args.CharacteristicValue()?)?;
                        let _ = sink.send(bytes);
                    }
                    Ok(())
                },
            );
            characteristic.ValueChanged(&handler)?
        };
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.insert(key, (characteristic.clone(), token));
        }

        let status = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )?
            .await?;
        if status != GattCommunicationStatus::Success {
            warn!("Notification subscription returned status: {:?}", status);
            self.remove_subscription(key);
            return Err(TransportError::Platform(format!(
                "Notification subscription failed: {:?}",
                status
            )));
        }
        Ok(())
    }

    async fn write(
        &self,
        mac_address: u64,
        char_uuid: &str,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(mac_address, char_uuid)?;

        let operation = {
            let writer = DataWriter::new()?;
            writer.WriteBytes(bytes)?;
            let buffer = writer.DetachBuffer()?;
            characteristic.WriteValueAsync(&buffer)?
        };

        let status = operation.await?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Platform(format!(
                "Write failed: {:?}",
                status
            )));
        }
        Ok(())
    }
}

/// Advertisement watcher feeding raw records into a channel
#[derive(Default)]
pub struct WinRtAdvertisementSource {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    // Shared with the event handler so `stop` can close the channel
    sink: Arc<Mutex<Option<mpsc::UnboundedSender<RawAdvertisement>>>>,
}

impl WinRtAdvertisementSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn to_raw(
        args: &BluetoothLEAdvertisementReceivedEventArgs,
    ) -> windows::core::Result<RawAdvertisement> {
        let adv = args.Advertisement()?;

        // The vehicle packs binary state into the name; keep it byte-for-byte
        let name = adv.LocalName()?;
        let local_name = (!name.is_empty()).then(|| {
            name.as_wide()
                .iter()
                .map(|&c| if c < 0x80 { c as u8 } else { b'?' })
                .collect()
        });

        let sections = adv.DataSections()?;
        let mut data_sections = Vec::with_capacity(sections.Size()? as usize);
        for i in 0..sections.Size()? {
            data_sections.push(read_buffer(&sections.GetAt(i)?.Data()?)?);
        }

        let manufacturer = adv.ManufacturerData()?;
        let mut manufacturer_data = Vec::with_capacity(manufacturer.Size()? as usize);
        for i in 0..manufacturer.Size()? {
            manufacturer_data.push(read_buffer(&manufacturer.GetAt(i)?.Data()?)?);
        }

        Ok(RawAdvertisement {
            mac_address: args.BluetoothAddress()?,
            rssi: args.RawSignalStrengthInDBm()?,
            local_name,
            data_sections,
            manufacturer_data,
        })
    }
}

impl AdvertisementSource for WinRtAdvertisementSource {
    fn start(&mut self, sink: mpsc::UnboundedSender<RawAdvertisement>) -> anyhow::Result<()> {
        self.stop()?;

        if let Ok(mut shared) = self.sink.lock() {
            *shared = Some(sink);
        }

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let shared = self.sink.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let raw = Self::to_raw(args)?;
                    if let Ok(guard) = shared.lock() {
                        if let Some(sink) = guard.as_ref() {
                            let _ = sink.send(raw);
                        }
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(watcher) = self.watcher.take() {
            watcher.Stop()?;
        }
        if let Ok(mut shared) = self.sink.lock() {
            shared.take();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.watcher.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_for_device() {
        let mut map: HashMap<(u64, u32), &str> = HashMap::new();
        map.insert((1, 10), "read");
        map.insert((1, 11), "write");
        map.insert((2, 10), "other");

        let mut taken = take_for_device(&mut map, 1);
        taken.sort();
        assert_eq!(taken, vec!["read", "write"]);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&(2, 10)));
        assert!(take_for_device(&mut map, 1).is_empty());
    }

    #[test]
    fn test_parse_guid() {
        let guid = parse_guid(protocol::SERVICE_UUID).unwrap();
        assert_eq!(guid.data1, 0xbe15beef);
        assert!(parse_guid("not-a-uuid").is_err());
    }
}
