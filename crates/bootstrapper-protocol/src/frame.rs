//! Frame layout and protocol constants.

/// Magic bytes opening every frame.
pub const HEADER: &[u8; 6] = b"IMPROV";

/// Supported protocol version.
pub const VERSION: u8 = 1;

/// Capacity of the inbound payload buffer.
pub const PAYLOAD_CAPACITY: usize = 128;

/// Idle polling ticks after which a partial frame is discarded.
pub const IDLE_TICK_LIMIT: u16 = 255;

pub const MAX_SSID_LEN: usize = 32;
pub const MAX_PASSPHRASE_LEN: usize = 64;

/// Fixed 4-byte firmware tag sent in device info responses.
pub const FIRMWARE_TAG_LEN: usize = 4;

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    CurrentState = 0x01,
    ErrorState = 0x02,
    RpcCommand = 0x03,
    RpcResponse = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::CurrentState),
            0x02 => Ok(FrameType::ErrorState),
            0x03 => Ok(FrameType::RpcCommand),
            0x04 => Ok(FrameType::RpcResponse),
            other => Err(other),
        }
    }
}

/// Provisioning state reported in `CurrentState` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Ready to accept credentials.
    Authorized = 0x02,
    /// Credentials received, joining.
    Provisioning = 0x03,
    /// On the network.
    Provisioned = 0x04,
}

impl TryFrom<u8> for DeviceState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x02 => Ok(DeviceState::Authorized),
            0x03 => Ok(DeviceState::Provisioning),
            0x04 => Ok(DeviceState::Provisioned),
            other => Err(other),
        }
    }
}

/// Error code carried by `ErrorState` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    None = 0x00,
    InvalidRpc = 0x01,
    UnknownRpc = 0x02,
    UnableToConnect = 0x03,
    Unknown = 0xFF,
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ErrorCode::None,
            0x01 => ErrorCode::InvalidRpc,
            0x02 => ErrorCode::UnknownRpc,
            0x03 => ErrorCode::UnableToConnect,
            _ => ErrorCode::Unknown,
        }
    }
}

/// RPC command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    WifiSettings = 0x01,
    RequestCurrentState = 0x02,
    RequestDeviceInfo = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::WifiSettings),
            0x02 => Ok(Command::RequestCurrentState),
            0x03 => Ok(Command::RequestDeviceInfo),
            other => Err(other),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
    pub checksum: u8,
}

/// Sum of all bytes modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        // "IMPROV" alone
        assert_eq!(checksum(HEADER), 221);
    }

    #[test]
    fn test_unknown_error_code() {
        assert_eq!(ErrorCode::from(0x42), ErrorCode::Unknown);
        assert_eq!(ErrorCode::from(0x03), ErrorCode::UnableToConnect);
    }
}
