//! # bootstrapper-protocol
//!
//! Binary provisioning protocol spoken over the serial console.
//!
//! Frames look like `IMPROV | version | type | length | payload | checksum`.
//! This crate provides the frame constants, the encoder for outbound
//! state/error/RPC frames, a byte-at-a-time parser for inbound RPC commands,
//! and decoding of the RPC command payloads.

pub mod codec;
pub mod command;
pub mod frame;
pub mod parser;

pub use codec::{
    decode_frame, decode_rpc_strings, encode_error, encode_rpc_command, encode_rpc_response, encode_state,
    encode_wifi_settings, CodecError,
};
pub use command::{CommandError, RpcCommand};
pub use frame::{checksum, Command, DeviceState, ErrorCode, Frame, FrameType};
pub use parser::{FrameParser, ParseEvent, ParseState, RawCommand, RejectReason};
