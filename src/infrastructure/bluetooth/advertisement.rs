//! Advertisement Decoder
//!
//! Turns a raw broadcast record into a partial vehicle record.
//!
//! # Local Name Layout
//!
//! ```text
//! [0]      : state bitmask
//!            bit 4: battery full
//!            bit 5: battery low
//!            bit 6: on charger
//! [1-7]    : vendor data (ignored)
//! [8..N-2] : display name
//! [N-1]    : null terminator
//! ```
//!
//! # Identity Block (data section 2)
//!
//! ```text
//! [0-1] : product id (u16 big-endian)
//! [2]   : reserved
//! [3]   : model code
//! [4-7] : identifier (u32 big-endian)
//! ```

use crate::domain::models::{format_mac, AdvertisementDiff, VehicleModel, VehicleState};
use crate::infrastructure::bluetooth::protocol::hex_string;
use std::fmt::Write;

pub const VEHICLE_STATE_FULL_BATTERY: u8 = 1 << 4;
pub const VEHICLE_STATE_LOW_BATTERY: u8 = 1 << 5;
pub const VEHICLE_STATE_ON_CHARGER: u8 = 1 << 6;

/// Bytes before the display name in the local name field
const NAME_PREFIX_LEN: usize = 8;
/// Index of the identity block among the data sections
const IDENTITY_SECTION: usize = 2;
const IDENTITY_BLOCK_LEN: usize = 8;

/// One advertisement as delivered by the platform watcher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub mac_address: u64,
    pub rssi: i16,
    pub local_name: Option<Vec<u8>>,
    /// Data sections in arrival order
    pub data_sections: Vec<Vec<u8>>,
    pub manufacturer_data: Vec<Vec<u8>>,
}

fn is_state_set(state: u8, flag: u8) -> bool {
    (state & flag) == flag
}

/// Decode an advertisement. Fields the record does not carry stay `None`.
pub fn decode_advertisement(adv: &RawAdvertisement) -> AdvertisementDiff {
    let mut diff = AdvertisementDiff {
        mac_address: adv.mac_address,
        ..Default::default()
    };

    if let Some(local_name) = adv.local_name.as_deref().filter(|n| !n.is_empty()) {
        let (name, state) = parse_local_name(local_name);
        diff.name = Some(name);
        diff.state = state;
    }

    if let Some(section) = adv.data_sections.get(IDENTITY_SECTION) {
        if section.len() >= IDENTITY_BLOCK_LEN {
            diff.product_id = Some(u16::from_be_bytes([section[0], section[1]]));
            diff.model = Some(VehicleModel::from(section[3]));
            diff.identifier = Some(u32::from_be_bytes([
                section[4], section[5], section[6], section[7],
            ]));
        }
    }

    diff
}

/// Too short a name yields an empty name and unknown flags
fn parse_local_name(bytes: &[u8]) -> (String, Option<VehicleState>) {
    if bytes.len() <= NAME_PREFIX_LEN {
        return (String::new(), None);
    }

    let state = bytes[0];
    let name_bytes = &bytes[NAME_PREFIX_LEN..bytes.len() - 1];
    let name = String::from_utf8_lossy(name_bytes).into_owned();

    (
        name,
        Some(VehicleState {
            battery_full: is_state_set(state, VEHICLE_STATE_FULL_BATTERY),
            battery_low: is_state_set(state, VEHICLE_STATE_LOW_BATTERY),
            on_charger: is_state_set(state, VEHICLE_STATE_ON_CHARGER),
        }),
    )
}

/// Multi-line diagnostic text for a decoded advertisement
pub fn describe(adv: &RawAdvertisement, diff: &AdvertisementDiff, raw_bytes: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Advertisement:");
    let _ = writeln!(
        out,
        "MAC: {} - Signal Strength: {}dBm",
        format_mac(adv.mac_address),
        adv.rssi
    );

    if raw_bytes {
        if let Some(local_name) = &adv.local_name {
            let _ = writeln!(out, "LocalName: {}", hex_string(local_name));
        }
        for (i, data) in adv.manufacturer_data.iter().enumerate() {
            let _ = writeln!(out, "Manuf Data {}: {}", i, hex_string(data));
        }
        for (i, data) in adv.data_sections.iter().enumerate() {
            let _ = writeln!(out, "Data Section {}: {}", i, hex_string(data));
        }
    }

    if let Some(name) = &diff.name {
        let _ = writeln!(out, "Name: {}", name);
    }
    if let Some(state) = diff.state {
        let _ = writeln!(out, "Battery Full: {}", state.battery_full);
        let _ = writeln!(out, "Battery Low: {}", state.battery_low);
        let _ = writeln!(out, "On Charger: {}", state.on_charger);
    }
    if let Some(identifier) = diff.identifier {
        let _ = writeln!(out, "ID: {}", identifier);
    }
    if let Some(model) = diff.model {
        let _ = writeln!(out, "Model: {}", model);
    }
    if let Some(product_id) = diff.product_id {
        let _ = writeln!(out, "Product ID: {}", product_id);
    }

    out
}
