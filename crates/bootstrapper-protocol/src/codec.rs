//! Frame encoding and whole-frame decoding.
//!
//! Outbound frames are built in one go. Inbound frames from the serial line
//! go through [`crate::parser::FrameParser`] instead; [`decode_frame`] is
//! for callers holding a complete buffer (tests, host tooling).

use crate::frame::{checksum, Command, DeviceState, ErrorCode, Frame, FrameType, HEADER, VERSION};
use thiserror::Error;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Payload does not fit the one-byte length field.
    #[error("Payload too long: {0} bytes")]
    PayloadTooLong(usize),

    /// Buffer shorter than the frame it announces.
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Magic bytes did not match.
    #[error("Bad frame header")]
    BadHeader,

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown frame type {0:#04x}")]
    UnknownFrameType(u8),

    #[error("Checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch { computed: u8, received: u8 },
}

fn encode_frame(frame_type: FrameType, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let length = u8::try_from(payload.len()).map_err(|_| CodecError::PayloadTooLong(payload.len()))?;
    let mut out = Vec::with_capacity(HEADER.len() + 4 + payload.len());
    out.extend_from_slice(HEADER);
    out.push(VERSION);
    out.push(frame_type as u8);
    out.push(length);
    out.extend_from_slice(payload);
    out.push(checksum(&out));
    Ok(out)
}

/// `CurrentState` frame carrying one status byte.
pub fn encode_state(state: DeviceState) -> Vec<u8> {
    encode_single(FrameType::CurrentState, state as u8)
}

/// `ErrorState` frame carrying one error byte.
pub fn encode_error(code: ErrorCode) -> Vec<u8> {
    encode_single(FrameType::ErrorState, code as u8)
}

fn encode_single(frame_type: FrameType, value: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER.len() + 5);
    out.extend_from_slice(HEADER);
    out.extend_from_slice(&[VERSION, frame_type as u8, 1, value]);
    out.push(checksum(&out));
    out
}

/// `RpcResponse` frame: `[command, data_len, (len, bytes)*]`.
pub fn encode_rpc_response(command: Command, strings: &[&str]) -> Result<Vec<u8>, CodecError> {
    let data = length_prefixed(strings)?;
    let mut payload = Vec::with_capacity(data.len() + 2);
    payload.push(command as u8);
    payload.push(u8::try_from(data.len()).map_err(|_| CodecError::PayloadTooLong(data.len()))?);
    payload.extend_from_slice(&data);
    encode_frame(FrameType::RpcResponse, &payload)
}

/// `RpcCommand` frame as a client would send it: `[command, data...]`.
pub fn encode_rpc_command(command: Command, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut payload = Vec::with_capacity(data.len() + 1);
    payload.push(command as u8);
    payload.extend_from_slice(data);
    encode_frame(FrameType::RpcCommand, &payload)
}

/// Complete `WifiSettings` command frame for the given credentials.
pub fn encode_wifi_settings(ssid: &str, passphrase: &str) -> Result<Vec<u8>, CodecError> {
    let body = length_prefixed(&[ssid, passphrase])?;
    let mut data = Vec::with_capacity(body.len() + 1);
    data.push(u8::try_from(body.len()).map_err(|_| CodecError::PayloadTooLong(body.len()))?);
    data.extend_from_slice(&body);
    encode_rpc_command(Command::WifiSettings, &data)
}

fn length_prefixed(strings: &[&str]) -> Result<Vec<u8>, CodecError> {
    let mut data = Vec::new();
    for s in strings {
        let len = u8::try_from(s.len()).map_err(|_| CodecError::PayloadTooLong(s.len()))?;
        data.push(len);
        data.extend_from_slice(s.as_bytes());
    }
    Ok(data)
}

/// Decode and verify one complete frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    const FIXED: usize = 6 + 3;
    if bytes.len() < FIXED + 1 {
        return Err(CodecError::Truncated {
            expected: FIXED + 1,
            actual: bytes.len(),
        });
    }
    if &bytes[..HEADER.len()] != HEADER {
        return Err(CodecError::BadHeader);
    }
    let version = bytes[6];
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let frame_type = FrameType::try_from(bytes[7]).map_err(CodecError::UnknownFrameType)?;
    let length = bytes[8] as usize;
    let expected = FIXED + length + 1;
    if bytes.len() < expected {
        return Err(CodecError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }

    let computed = checksum(&bytes[..FIXED + length]);
    let received = bytes[FIXED + length];
    if computed != received {
        return Err(CodecError::ChecksumMismatch { computed, received });
    }

    Ok(Frame {
        version,
        frame_type,
        payload: bytes[FIXED..FIXED + length].to_vec(),
        checksum: received,
    })
}

/// Split an RPC response payload back into its strings.
pub fn decode_rpc_strings(payload: &[u8]) -> Option<(u8, Vec<String>)> {
    let (&command, rest) = payload.split_first()?;
    let (&data_len, mut data) = rest.split_first()?;
    if data.len() != data_len as usize {
        return None;
    }
    let mut strings = Vec::new();
    while let Some((&len, tail)) = data.split_first() {
        let len = len as usize;
        if tail.len() < len {
            return None;
        }
        strings.push(String::from_utf8_lossy(&tail[..len]).into_owned());
        data = &tail[len..];
    }
    Some((command, strings))
}
