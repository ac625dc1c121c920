use crate::infrastructure::bluetooth::protocol::TypedResponse;
use std::fmt;

/// Known vehicle model codes carried in the identity block of an advertisement.
///
/// Codes 13 and 14 have never been observed on real hardware; their names are
/// a best guess at the lineup ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VehicleModel {
    Groundshock,
    Skull,
    Thermo,
    Nuke,
    Guardian,
    BigBang,
    X52,
    Freewheel,
    /// A code outside the known table, preserved as-is
    Unknown(u8),
}

impl From<u8> for VehicleModel {
    fn from(code: u8) -> Self {
        match code {
            8 => Self::Groundshock,
            9 => Self::Skull,
            10 => Self::Thermo,
            11 => Self::Nuke,
            12 => Self::Guardian,
            13 => Self::BigBang,
            14 => Self::X52,
            15 => Self::Freewheel,
            other => Self::Unknown(other),
        }
    }
}

impl From<VehicleModel> for u8 {
    fn from(model: VehicleModel) -> Self {
        match model {
            VehicleModel::Groundshock => 8,
            VehicleModel::Skull => 9,
            VehicleModel::Thermo => 10,
            VehicleModel::Nuke => 11,
            VehicleModel::Guardian => 12,
            VehicleModel::BigBang => 13,
            VehicleModel::X52 => 14,
            VehicleModel::Freewheel => 15,
            VehicleModel::Unknown(code) => code,
        }
    }
}

impl fmt::Display for VehicleModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "Unknown({})", code),
            known => write!(f, "{:?}", known),
        }
    }
}

/// Identity and last-known state of one physical vehicle.
///
/// Records handed out by the registry are owned snapshots; mutating one has
/// no effect on the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleRecord {
    pub mac_address: u64,
    pub product_id: Option<u16>,
    pub identifier: Option<u32>,
    pub model: Option<VehicleModel>,
    pub name: Option<String>,
    pub battery_full: Option<bool>,
    pub battery_low: Option<bool>,
    pub on_charger: Option<bool>,
}

impl VehicleRecord {
    pub fn new(mac_address: u64) -> Self {
        Self {
            mac_address,
            ..Default::default()
        }
    }

    /// Apply the fields present in `diff`. Absent fields keep their previous value.
    pub fn merge(&mut self, diff: &AdvertisementDiff) {
        if let Some(product_id) = diff.product_id {
            self.product_id = Some(product_id);
        }
        if let Some(identifier) = diff.identifier {
            self.identifier = Some(identifier);
        }
        if let Some(model) = diff.model {
            self.model = Some(model);
        }
        // Short local names decode to "" and must not erase a known name
        if let Some(name) = diff
            .name
            .as_ref()
            .filter(|n| !n.is_empty() || self.name.is_none())
        {
            self.name = Some(name.clone());
        }
        if let Some(state) = diff.state {
            self.battery_full = Some(state.battery_full);
            self.battery_low = Some(state.battery_low);
            self.on_charger = Some(state.on_charger);
        }
    }

    /// Label used when listing vehicles to the operator
    pub fn display_model(&self) -> String {
        self.model
            .map(|m| m.to_string())
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

/// Battery/charger flags decoded from the advertisement state byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VehicleState {
    pub battery_full: bool,
    pub battery_low: bool,
    pub on_charger: bool,
}

/// Partial vehicle record decoded from a single advertisement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementDiff {
    pub mac_address: u64,
    pub name: Option<String>,
    pub state: Option<VehicleState>,
    pub product_id: Option<u16>,
    pub model: Option<VehicleModel>,
    pub identifier: Option<u32>,
}

/// Lifecycle of the connection to one vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Discovered,
    Unpaired,
    PairedElsewhere,
    Paired,
    Connected,
    Communicating,
    Disconnected,
}

impl ConnectionState {
    /// Whether the lifecycle may move from `self` to `next`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            // Cleanup is reachable from anywhere
            (_, Unpaired) | (_, Disconnected) => true,
            (Discovered, PairedElsewhere) => true,
            (Discovered, Paired) | (Unpaired, Paired) | (PairedElsewhere, Paired) => true,
            (Paired, Connected) => true,
            (Connected, Communicating) => true,
            (Disconnected, Paired) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    VehicleFound(VehicleRecord),
    ConnectionState {
        mac_address: u64,
        state: ConnectionState,
    },
    Response(TypedResponse),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Format a 48-bit Bluetooth address as `AA:BB:CC:DD:EE:FF`
pub fn format_mac(address: u64) -> String {
    (0..6)
        .rev()
        .map(|i| format!("{:02X}", (address >> (8 * i)) & 0xff))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_codes() {
        assert_eq!(VehicleModel::from(8), VehicleModel::Groundshock);
        assert_eq!(VehicleModel::from(15), VehicleModel::Freewheel);
        assert_eq!(VehicleModel::from(42), VehicleModel::Unknown(42));
        assert_eq!(u8::from(VehicleModel::Unknown(42)), 42);
        assert_eq!(u8::from(VehicleModel::Nuke), 11);
    }

    #[test]
    fn test_model_display() {
        assert_eq!(VehicleModel::Skull.to_string(), "Skull");
        assert_eq!(VehicleModel::Unknown(3).to_string(), "Unknown(3)");
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac(0xAABBCCDDEEFF), "AA:BB:CC:DD:EE:FF");
        assert_eq!(format_mac(0x01), "00:00:00:00:00:01");
    }

    #[test]
    fn test_merge_keeps_known_fields() {
        let mut record = VehicleRecord::new(1);
        record.merge(&AdvertisementDiff {
            mac_address: 1,
            name: Some("X".into()),
            state: Some(VehicleState {
                battery_full: true,
                battery_low: false,
                on_charger: true,
            }),
            ..Default::default()
        });
        record.merge(&AdvertisementDiff {
            mac_address: 1,
            product_id: Some(48879),
            ..Default::default()
        });

        assert_eq!(record.name.as_deref(), Some("X"));
        assert_eq!(record.product_id, Some(48879));
        assert_eq!(record.battery_full, Some(true));
        assert_eq!(record.on_charger, Some(true));
    }

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;
        assert!(Discovered.can_transition_to(Paired));
        assert!(Paired.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Communicating));
        assert!(Communicating.can_transition_to(Unpaired));
        assert!(!Discovered.can_transition_to(Communicating));
        assert!(!Paired.can_transition_to(Communicating));
    }
}
