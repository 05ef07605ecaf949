//! Inter-controller protocol: constants, packet types, command opcodes, event ids.

/// Sentinel at the start of every packet.
pub const MAGIC: u16 = 0x55AA;

/// Current protocol version. Carried in every header.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Header size on the wire: magic:2, version:1, type:1, sequence:2, length:2, checksum:2.
pub const HEADER_SIZE: usize = 10;

/// Largest packet either controller will emit or accept.
pub const MAX_PACKET_SIZE: usize = 256;

/// Largest payload a single packet may carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// Largest argument block of a COMMAND (the opcode byte takes one payload byte).
pub const MAX_COMMAND_DATA: usize = MAX_PAYLOAD_SIZE - 1;

/// Retry budget for callers. The protocol layer itself never retries.
pub const MAX_RETRIES: u32 = 3;

/// Default overall timeout for request/ack exchanges.
pub const DEFAULT_TIMEOUT_MS: u32 = 100;

/// Sub-timeout used while polling the transport for an ack, response or event.
pub const POLL_INTERVAL_MS: u32 = 10;

/// Pause between consecutive chunks of a streamed `send_data`.
pub const INTER_CHUNK_DELAY_MS: u32 = 1;

/// Packet type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Command = 0x01,
    Response = 0x02,
    Event = 0x03,
    Ack = 0x04,
    Nack = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Command),
            0x02 => Ok(PacketType::Response),
            0x03 => Ok(PacketType::Event),
            0x04 => Ok(PacketType::Ack),
            0x05 => Ok(PacketType::Nack),
            other => Err(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(t: PacketType) -> u8 {
        t as u8
    }
}

/// Command opcode, prefixed to every COMMAND payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Ping = 0x01,
    GetStatus = 0x02,
    ExecutePayload = 0x03,
    TriggerEvent = 0x04,
    SendData = 0x05,
    ReceiveData = 0x06,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Ping),
            0x02 => Ok(Command::GetStatus),
            0x03 => Ok(Command::ExecutePayload),
            0x04 => Ok(Command::TriggerEvent),
            0x05 => Ok(Command::SendData),
            0x06 => Ok(Command::ReceiveData),
            other => Err(other),
        }
    }
}

/// First byte of a RESPONSE payload produced by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Success = 0x00,
    Error = 0x01,
    Busy = 0x02,
    Timeout = 0x03,
    Invalid = 0x04,
}

impl TryFrom<u8> for StatusCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x00 => Ok(StatusCode::Success),
            0x01 => Ok(StatusCode::Error),
            0x02 => Ok(StatusCode::Busy),
            0x03 => Ok(StatusCode::Timeout),
            0x04 => Ok(StatusCode::Invalid),
            other => Err(other),
        }
    }
}

/// First id of the application-defined event range.
pub const EVENT_CUSTOM_BASE: u32 = 0x1000;

/// Size of the event id prefix of an EVENT payload.
pub const EVENT_ID_SIZE: usize = 4;

/// Event id space: reserved system events plus an open custom range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventId {
    SystemBoot,
    UsbConnected,
    UsbDisconnected,
    WifiConnected,
    WifiDisconnected,
    BleConnected,
    BleDisconnected,
    OsDetected,
    PayloadStart,
    PayloadComplete,
    ButtonPressed,
    SecurityAlert,
    /// Application event at or above `EVENT_CUSTOM_BASE`.
    Custom(CustomEvent),
}

/// Application event id. Only constructible at or above `EVENT_CUSTOM_BASE`, so it can
/// never alias a system event on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CustomEvent(u32);

impl CustomEvent {
    pub fn new(id: u32) -> Option<Self> {
        (id >= EVENT_CUSTOM_BASE).then_some(CustomEvent(id))
    }

    pub fn id(self) -> u32 {
        self.0
    }
}

impl EventId {
    /// Build an application event. Returns None below the custom base.
    pub fn custom(id: u32) -> Option<Self> {
        CustomEvent::new(id).map(EventId::Custom)
    }

    pub fn to_u32(self) -> u32 {
        match self {
            EventId::SystemBoot => 0,
            EventId::UsbConnected => 1,
            EventId::UsbDisconnected => 2,
            EventId::WifiConnected => 3,
            EventId::WifiDisconnected => 4,
            EventId::BleConnected => 5,
            EventId::BleDisconnected => 6,
            EventId::OsDetected => 7,
            EventId::PayloadStart => 8,
            EventId::PayloadComplete => 9,
            EventId::ButtonPressed => 10,
            EventId::SecurityAlert => 11,
            EventId::Custom(c) => c.id(),
        }
    }

    /// Decode a wire id. Ids between the last system event and the custom base are unassigned.
    pub fn from_u32(id: u32) -> Option<Self> {
        Some(match id {
            0 => EventId::SystemBoot,
            1 => EventId::UsbConnected,
            2 => EventId::UsbDisconnected,
            3 => EventId::WifiConnected,
            4 => EventId::WifiDisconnected,
            5 => EventId::BleConnected,
            6 => EventId::BleDisconnected,
            7 => EventId::OsDetected,
            8 => EventId::PayloadStart,
            9 => EventId::PayloadComplete,
            10 => EventId::ButtonPressed,
            11 => EventId::SecurityAlert,
            id if id >= EVENT_CUSTOM_BASE => EventId::Custom(CustomEvent(id)),
            _ => return None,
        })
    }
}
