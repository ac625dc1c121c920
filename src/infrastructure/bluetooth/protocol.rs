//! Vehicle Message Protocol
//!
//! Frame codec for the command/response messages exchanged with a vehicle
//! over the read (notify) and write characteristics.
//!
//! # Frame Layout
//!
//! ```text
//! [0]      : size   (payload length + 1)
//! [1]      : msg id (command/response code)
//! [2..N-1] : payload (0-18 bytes, multi-byte fields little-endian)
//! ```

use std::fmt;
use thiserror::Error;

/// Vehicle BLE Service UUID
pub const SERVICE_UUID: &str = "be15beef-6186-407e-8381-0bd89c4d8df4";

/// Read/notify characteristic - responses from the vehicle
pub const READ_CHAR_UUID: &str = "be15bee0-6186-407e-8381-0bd89c4d8df4";

/// Write characteristic - commands to the vehicle
pub const WRITE_CHAR_UUID: &str = "be15bee1-6186-407e-8381-0bd89c4d8df4";

/// Largest frame the vehicle accepts, header included
pub const MSG_MAX_SIZE: usize = 20;
/// Largest payload that fits in one frame
pub const MSG_PAYLOAD_MAX_SIZE: usize = 18;
/// Value of the size byte for a frame with no payload
pub const MSG_BASE_SIZE: u8 = 1;
/// Size + msg id
pub const MSG_HEADER_SIZE: usize = 2;

/// SDK mode flag: let the host override on-track localization
pub const SDK_OPTION_OVERRIDE_LOCALIZATION: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    EncodingConstraintViolation { size: usize, max: usize },
}

/// Message codes. Codes outside the table are carried as `Unrecognized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Disconnect,
    PingRequest,
    PingResponse,
    VersionRequest,
    VersionResponse,
    BatteryLevelRequest,
    BatteryLevelResponse,
    SetLights,
    SetSpeed,
    ChangeLane,
    CancelLaneChange,
    LocalizationPositionUpdate,
    LocalizationTransitionUpdate,
    LocalizationIntersectionUpdate,
    VehicleDelocalized,
    SetOffsetFromRoadCenter,
    OffsetFromRoadCenterUpdate,
    Turn,
    LightsPattern,
    SetConfigParams,
    SdkMode,
    Unrecognized(u8),
}

impl From<u8> for MessageId {
    fn from(code: u8) -> Self {
        match code {
            0x0d => Self::Disconnect,
            0x16 => Self::PingRequest,
            0x17 => Self::PingResponse,
            0x18 => Self::VersionRequest,
            0x19 => Self::VersionResponse,
            0x1a => Self::BatteryLevelRequest,
            0x1b => Self::BatteryLevelResponse,
            0x1d => Self::SetLights,
            0x24 => Self::SetSpeed,
            0x25 => Self::ChangeLane,
            0x26 => Self::CancelLaneChange,
            0x27 => Self::LocalizationPositionUpdate,
            0x29 => Self::LocalizationTransitionUpdate,
            0x2a => Self::LocalizationIntersectionUpdate,
            0x2b => Self::VehicleDelocalized,
            0x2c => Self::SetOffsetFromRoadCenter,
            0x2d => Self::OffsetFromRoadCenterUpdate,
            0x32 => Self::Turn,
            0x33 => Self::LightsPattern,
            0x45 => Self::SetConfigParams,
            0x90 => Self::SdkMode,
            other => Self::Unrecognized(other),
        }
    }
}

impl From<MessageId> for u8 {
    fn from(id: MessageId) -> Self {
        match id {
            MessageId::Disconnect => 0x0d,
            MessageId::PingRequest => 0x16,
            MessageId::PingResponse => 0x17,
            MessageId::VersionRequest => 0x18,
            MessageId::VersionResponse => 0x19,
            MessageId::BatteryLevelRequest => 0x1a,
            MessageId::BatteryLevelResponse => 0x1b,
            MessageId::SetLights => 0x1d,
            MessageId::SetSpeed => 0x24,
            MessageId::ChangeLane => 0x25,
            MessageId::CancelLaneChange => 0x26,
            MessageId::LocalizationPositionUpdate => 0x27,
            MessageId::LocalizationTransitionUpdate => 0x29,
            MessageId::LocalizationIntersectionUpdate => 0x2a,
            MessageId::VehicleDelocalized => 0x2b,
            MessageId::SetOffsetFromRoadCenter => 0x2c,
            MessageId::OffsetFromRoadCenterUpdate => 0x2d,
            MessageId::Turn => 0x32,
            MessageId::LightsPattern => 0x33,
            MessageId::SetConfigParams => 0x45,
            MessageId::SdkMode => 0x90,
            MessageId::Unrecognized(code) => code,
        }
    }
}

impl MessageId {
    /// Response code the vehicle answers a request with, if any
    pub fn response_for(self) -> Option<MessageId> {
        match self {
            Self::PingRequest => Some(Self::PingResponse),
            Self::VersionRequest => Some(Self::VersionResponse),
            Self::BatteryLevelRequest => Some(Self::BatteryLevelResponse),
            _ => None,
        }
    }
}

/// One wire frame. Built fresh for every send and receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub size: u8,
    pub msg_id: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a frame, rejecting payloads that do not fit
    pub fn new(msg_id: MessageId, payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() > MSG_PAYLOAD_MAX_SIZE {
            return Err(ProtocolError::EncodingConstraintViolation {
                size: payload.len(),
                max: MSG_PAYLOAD_MAX_SIZE,
            });
        }
        Ok(Self {
            size: MSG_BASE_SIZE + payload.len() as u8,
            msg_id,
            payload: payload.to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MSG_HEADER_SIZE + self.payload.len());
        buf.push(self.size);
        buf.push(self.msg_id.into());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Commands the host can send to a vehicle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VehicleCommand {
    Ping,
    VersionRequest,
    BatteryRequest,
    Disconnect,
    SdkMode { on: bool, flags: u8 },
    /// Any other code with a caller-supplied payload
    Raw { id: MessageId, payload: Vec<u8> },
}

impl VehicleCommand {
    pub fn msg_id(&self) -> MessageId {
        match self {
            Self::Ping => MessageId::PingRequest,
            Self::VersionRequest => MessageId::VersionRequest,
            Self::BatteryRequest => MessageId::BatteryLevelRequest,
            Self::Disconnect => MessageId::Disconnect,
            Self::SdkMode { .. } => MessageId::SdkMode,
            Self::Raw { id, .. } => *id,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Self::SdkMode { on, flags } => vec![u8::from(*on), *flags],
            Self::Raw { payload, .. } => payload.clone(),
            _ => Vec::new(),
        }
    }
}

/// Encode a command into a ready-to-write frame
pub fn encode(command: &VehicleCommand) -> Result<Vec<u8>, ProtocolError> {
    let message = Message::new(command.msg_id(), &command.payload())?;
    Ok(message.to_bytes())
}

/// Split a received buffer into header fields and payload
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    if bytes.len() < MSG_HEADER_SIZE {
        return Err(ProtocolError::MalformedFrame(format!(
            "frame is {} bytes, need at least {}",
            bytes.len(),
            MSG_HEADER_SIZE
        )));
    }
    Ok(Message {
        size: bytes[0],
        msg_id: MessageId::from(bytes[1]),
        payload: bytes[2..].to_vec(),
    })
}

/// Decoded vehicle response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedResponse {
    Ping,
    Version(u16),
    BatteryLevel(u16),
    /// Frame with a code this codec has no layout for
    Unknown { msg_id: u8, hex: String },
}

impl fmt::Display for TypedResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ping => write!(f, "PING_RESPONSE"),
            Self::Version(version) => write!(f, "VERSION_RESPONSE: {}", version),
            Self::BatteryLevel(level) => write!(f, "BATTERY_RESPONSE: {}", level),
            Self::Unknown { hex, .. } => write!(f, "RESPONSE: {}", hex),
        }
    }
}

/// Give a decoded frame its typed meaning
pub fn interpret(message: &Message) -> Result<TypedResponse, ProtocolError> {
    match message.msg_id {
        MessageId::PingResponse => Ok(TypedResponse::Ping),
        MessageId::VersionResponse => read_u16(message).map(TypedResponse::Version),
        MessageId::BatteryLevelResponse => read_u16(message).map(TypedResponse::BatteryLevel),
        other => Ok(TypedResponse::Unknown {
            msg_id: other.into(),
            hex: hex_string(&message.payload),
        }),
    }
}

fn read_u16(message: &Message) -> Result<u16, ProtocolError> {
    match message.payload.as_slice() {
        [lo, hi] => Ok(u16::from_le_bytes([*lo, *hi])),
        other => Err(ProtocolError::MalformedFrame(format!(
            "{:?} payload is {} bytes, expected 2",
            message.msg_id,
            other.len()
        ))),
    }
}

/// Uppercase hex pairs joined with `-`, e.g. `AB-CD`
pub fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join("-")
}

/// 128-bit UUID split into the GUID field layout used by the platform stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UuidParts {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

/// Parse a `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` UUID string
pub fn parse_uuid(uuid_str: &str) -> anyhow::Result<UuidParts> {
    let uuid_str = uuid_str.replace('-', "");

    if uuid_str.len() != 32 || !uuid_str.is_ascii() {
        return Err(anyhow::anyhow!("Invalid UUID format"));
    }

    let data1 = u32::from_str_radix(&uuid_str[0..8], 16)?;
    let data2 = u16::from_str_radix(&uuid_str[8..12], 16)?;
    let data3 = u16::from_str_radix(&uuid_str[12..16], 16)?;

    let mut data4 = [0u8; 8];
    for (i, byte) in data4.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&uuid_str[16 + i * 2..18 + i * 2], 16)?;
    }

    Ok(UuidParts {
        data1,
        data2,
        data3,
        data4,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINED_CODES: &[u8] = &[
        0x0d, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b, 0x1d, 0x24, 0x25, 0x26, 0x27, 0x29, 0x2a, 0x2b,
        0x2c, 0x2d, 0x32, 0x33, 0x45, 0x90,
    ];

    #[test]
    fn test_parse_uuid() {
        let service = parse_uuid(SERVICE_UUID).unwrap();
        assert_eq!(service.data1, 0xbe15beef);
        assert_eq!(service.data4[7], 0xf4);

        let read = parse_uuid(READ_CHAR_UUID).unwrap();
        let write = parse_uuid(WRITE_CHAR_UUID).unwrap();
        assert_eq!(read.data1, 0xbe15bee0);
        assert_eq!(write.data1, 0xbe15bee1);
        assert_eq!(read.data4, write.data4);

        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_command_bytes() {
        assert_eq!(encode(&VehicleCommand::Ping).unwrap(), vec![0x01, 0x16]);
        assert_eq!(
            encode(&VehicleCommand::VersionRequest).unwrap(),
            vec![0x01, 0x18]
        );
        assert_eq!(
            encode(&VehicleCommand::BatteryRequest).unwrap(),
            vec![0x01, 0x1a]
        );
        assert_eq!(
            encode(&VehicleCommand::SdkMode {
                on: true,
                flags: SDK_OPTION_OVERRIDE_LOCALIZATION
            })
            .unwrap(),
            vec![0x03, 0x90, 0x01, 0x01]
        );
    }

    #[test]
    fn test_message_id_codes_are_stable() {
        for &code in DEFINED_CODES {
            let id = MessageId::from(code);
            assert!(!matches!(id, MessageId::Unrecognized(_)), "{:#x}", code);
            assert_eq!(u8::from(id), code);
        }
        assert_eq!(MessageId::from(0xff), MessageId::Unrecognized(0xff));
    }

    #[test]
    fn test_round_trip_every_payload_length() {
        for &code in DEFINED_CODES {
            for len in 0..=MSG_PAYLOAD_MAX_SIZE {
                let payload: Vec<u8> = (0..len as u8).collect();
                let command = VehicleCommand::Raw {
                    id: MessageId::from(code),
                    payload: payload.clone(),
                };
                let bytes = encode(&command).unwrap();
                assert!(bytes.len() <= MSG_MAX_SIZE);

                let message = decode(&bytes).unwrap();
                assert_eq!(message.size as usize, len + 1);
                assert_eq!(u8::from(message.msg_id), code);
                assert_eq!(message.payload, payload);
            }
        }
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let command = VehicleCommand::Raw {
            id: MessageId::SetSpeed,
            payload: vec![0; 19],
        };
        assert_eq!(
            encode(&command),
            Err(ProtocolError::EncodingConstraintViolation { size: 19, max: 18 })
        );
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(matches!(
            decode(&[0x01]),
            Err(ProtocolError::MalformedFrame(_))
        ));
        assert!(matches!(decode(&[]), Err(ProtocolError::MalformedFrame(_))));

        let header_only = decode(&[0x01, 0x17]).unwrap();
        assert!(header_only.payload.is_empty());
    }

    #[test]
    fn test_interpret_known_responses() {
        let ping = decode(&[0x01, 0x17]).unwrap();
        assert_eq!(interpret(&ping).unwrap(), TypedResponse::Ping);

        let version = decode(&[0x03, 0x19, 0x34, 0x12]).unwrap();
        assert_eq!(interpret(&version).unwrap(), TypedResponse::Version(0x1234));

        let battery = decode(&[0x03, 0x1b, 0xd0, 0x0f]).unwrap();
        assert_eq!(
            interpret(&battery).unwrap(),
            TypedResponse::BatteryLevel(4048)
        );
    }

    #[test]
    fn test_interpret_short_version_is_malformed() {
        let version = decode(&[0x02, 0x19, 0x34]).unwrap();
        assert!(matches!(
            interpret(&version),
            Err(ProtocolError::MalformedFrame(_))
        ));

        let battery = decode(&[0x04, 0x1b, 0x01, 0x02, 0x03]).unwrap();
        assert!(interpret(&battery).is_err());
    }

    #[test]
    fn test_interpret_unknown_as_hex() {
        let message = decode(&[0x03, 0xFF, 0xAB, 0xCD]).unwrap();
        let response = interpret(&message).unwrap();
        assert_eq!(
            response,
            TypedResponse::Unknown {
                msg_id: 0xFF,
                hex: "AB-CD".to_string()
            }
        );
        assert_eq!(response.to_string(), "RESPONSE: AB-CD");
    }

    #[test]
    fn test_reserved_codes_fall_through() {
        let message = decode(&[0x02, 0x27, 0x05]).unwrap();
        assert_eq!(
            interpret(&message).unwrap().to_string(),
            "RESPONSE: 05".to_string()
        );
    }

    #[test]
    fn test_response_for() {
        assert_eq!(
            MessageId::PingRequest.response_for(),
            Some(MessageId::PingResponse)
        );
        assert_eq!(MessageId::SetSpeed.response_for(), None);
    }
}
