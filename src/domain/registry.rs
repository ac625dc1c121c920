use crate::domain::models::{AdvertisementDiff, VehicleRecord};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Product id every vehicle advertises
pub const VEHICLE_PRODUCT_ID: u16 = 0xBEEF;
/// Name some vehicles advertise before their identity block is seen
pub const VEHICLE_NAME: &str = "Drive";

/// Result of merging one advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// No record existed for this address before
    pub created: bool,
    /// Newly created and matches the vehicle signature
    pub qualifying_new: bool,
}

#[derive(Default)]
struct RegistryInner {
    records: Vec<VehicleRecord>,
    index: HashMap<u64, usize>,
    qualifying: Vec<u64>,
}

/// Deduplicated set of discovered devices, keyed by Bluetooth address.
///
/// Cloning yields another handle to the same registry. All mutation goes
/// through [`VehicleRegistry::upsert`]; readers only ever get copies.
#[derive(Clone, Default)]
pub struct VehicleRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl VehicleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // Records are merged field by field, so a poisoned lock still holds valid data
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Merge an advertisement into the record for its address
    pub fn upsert(&self, diff: &AdvertisementDiff) -> UpsertOutcome {
        let mut inner = self.lock();
        let mac = diff.mac_address;

        match inner.index.get(&mac).copied() {
            Some(i) => {
                inner.records[i].merge(diff);
                UpsertOutcome {
                    created: false,
                    qualifying_new: false,
                }
            }
            None => {
                let mut record = VehicleRecord::new(mac);
                record.merge(diff);
                let qualifying_new = Self::qualifies(&record);

                let position = inner.records.len();
                inner.records.push(record);
                inner.index.insert(mac, position);
                if qualifying_new {
                    inner.qualifying.push(mac);
                }

                UpsertOutcome {
                    created: true,
                    qualifying_new,
                }
            }
        }
    }

    /// Whether a record looks like a vehicle rather than some other nearby device
    pub fn qualifies(record: &VehicleRecord) -> bool {
        record.product_id == Some(VEHICLE_PRODUCT_ID) || record.name.as_deref() == Some(VEHICLE_NAME)
    }

    /// Every known device in first-seen order
    pub fn list(&self) -> Vec<VehicleRecord> {
        self.lock().records.clone()
    }

    /// Vehicles that qualified on first sighting, in first-seen order
    pub fn qualifying(&self) -> Vec<VehicleRecord> {
        let inner = self.lock();
        inner
            .qualifying
            .iter()
            .filter_map(|mac| inner.index.get(mac).map(|&i| inner.records[i].clone()))
            .collect()
    }

    pub fn get(&self, mac_address: u64) -> Option<VehicleRecord> {
        let inner = self.lock();
        inner
            .index
            .get(&mac_address)
            .map(|&i| inner.records[i].clone())
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
