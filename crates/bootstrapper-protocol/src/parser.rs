//! Byte-at-a-time parser for inbound RPC command frames.
//!
//! The serial line is read one byte per call. The parser walks the frame
//! layout with an explicit state and keeps the payload in a single fixed
//! buffer:
//!
//! ```text
//! offset  0..6    7     8      9        10..10+N-1   last
//!         IMPROV  ver   type   N        payload      checksum
//!                       (=3)   cmd(9)
//! ```
//!
//! `N` covers the command byte plus the payload. The checksum is the sum of
//! every preceding byte modulo 256.
//!
//! Anything that is not a version-1 `RpcCommand` frame is dropped without a
//! reply. A frame left half-read for [`IDLE_TICK_LIMIT`] idle ticks is
//! discarded as well.

use crate::frame::{checksum, FrameType, HEADER, IDLE_TICK_LIMIT, PAYLOAD_CAPACITY, VERSION};
use tracing::{debug, trace};

/// Where the parser is inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Matching the magic; `matched` bytes seen so far.
    WaitHeader { matched: usize },
    ReadVersion,
    ReadType,
    ReadLength,
    ReadCommandType,
    ReadPayload,
    VerifyChecksum,
}

/// Why a frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Version(u8),
    FrameType(u8),
    /// Zero length, or a payload larger than the buffer.
    Length(u8),
}

/// A checksum-verified command, not yet interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    pub command: u8,
    pub data: Vec<u8>,
}

/// Outcome of feeding one byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    /// Byte consumed, frame not complete.
    Pending,
    Frame(RawCommand),
    /// Complete frame whose checksum did not match. The caller answers with
    /// an error frame.
    ChecksumMismatch { computed: u8, received: u8 },
    /// Frame dropped silently.
    Rejected(RejectReason),
}

/// Streaming frame parser.
#[derive(Debug, Clone)]
pub struct FrameParser {
    state: ParseState,
    length: u8,
    command: u8,
    buffer: [u8; PAYLOAD_CAPACITY],
    filled: usize,
    idle_ticks: u16,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::WaitHeader { matched: 0 },
            length: 0,
            command: 0,
            buffer: [0; PAYLOAD_CAPACITY],
            filled: 0,
            idle_ticks: 0,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Whether a frame is partially read.
    pub fn in_frame(&self) -> bool {
        self.state != ParseState::WaitHeader { matched: 0 }
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.state = ParseState::WaitHeader { matched: 0 };
        self.length = 0;
        self.command = 0;
        self.filled = 0;
        self.idle_ticks = 0;
    }

    /// One idle polling tick with no byte available.
    ///
    /// Returns `true` when a partial frame was discarded.
    pub fn idle_tick(&mut self) -> bool {
        if !self.in_frame() {
            return false;
        }
        self.idle_ticks = self.idle_ticks.saturating_add(1);
        if self.idle_ticks >= IDLE_TICK_LIMIT {
            debug!(state = ?self.state, "Provisioning frame timed out");
            self.reset();
            return true;
        }
        false
    }

    /// Feed one byte.
    pub fn push(&mut self, byte: u8) -> ParseEvent {
        self.idle_ticks = 0;
        match self.state {
            ParseState::WaitHeader { matched } => {
                if byte == HEADER[matched] {
                    self.state = if matched + 1 == HEADER.len() {
                        ParseState::ReadVersion
                    } else {
                        ParseState::WaitHeader { matched: matched + 1 }
                    };
                } else if byte == HEADER[0] {
                    // A stray 'I' may start the real header
                    self.state = ParseState::WaitHeader { matched: 1 };
                } else {
                    self.state = ParseState::WaitHeader { matched: 0 };
                }
                ParseEvent::Pending
            }
            ParseState::ReadVersion => {
                if byte != VERSION {
                    return self.reject(RejectReason::Version(byte));
                }
                self.state = ParseState::ReadType;
                ParseEvent::Pending
            }
            ParseState::ReadType => {
                if byte != FrameType::RpcCommand as u8 {
                    return self.reject(RejectReason::FrameType(byte));
                }
                self.state = ParseState::ReadLength;
                ParseEvent::Pending
            }
            ParseState::ReadLength => {
                if byte == 0 || (byte as usize - 1) > PAYLOAD_CAPACITY {
                    return self.reject(RejectReason::Length(byte));
                }
                self.length = byte;
                self.state = ParseState::ReadCommandType;
                ParseEvent::Pending
            }
            ParseState::ReadCommandType => {
                self.command = byte;
                self.filled = 0;
                self.state = if self.payload_len() == 0 {
                    ParseState::VerifyChecksum
                } else {
                    ParseState::ReadPayload
                };
                ParseEvent::Pending
            }
            ParseState::ReadPayload => {
                self.buffer[self.filled] = byte;
                self.filled += 1;
                if self.filled == self.payload_len() {
                    self.state = ParseState::VerifyChecksum;
                }
                ParseEvent::Pending
            }
            ParseState::VerifyChecksum => {
                let computed = self.computed_checksum();
                let event = if computed == byte {
                    trace!(command = self.command, bytes = self.filled, "Provisioning frame received");
                    ParseEvent::Frame(RawCommand {
                        command: self.command,
                        data: self.buffer[..self.filled].to_vec(),
                    })
                } else {
                    debug!(computed, received = byte, "Provisioning frame checksum mismatch");
                    ParseEvent::ChecksumMismatch {
                        computed,
                        received: byte,
                    }
                };
                self.reset();
                event
            }
        }
    }

    fn payload_len(&self) -> usize {
        self.length.saturating_sub(1) as usize
    }

    fn computed_checksum(&self) -> u8 {
        let fixed = [VERSION, FrameType::RpcCommand as u8, self.length, self.command];
        checksum(HEADER)
            .wrapping_add(checksum(&fixed))
            .wrapping_add(checksum(&self.buffer[..self.filled]))
    }

    fn reject(&mut self, reason: RejectReason) -> ParseEvent {
        debug!(?reason, "Provisioning frame dropped");
        self.reset();
        ParseEvent::Rejected(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_rpc_command, encode_state, encode_wifi_settings};
    use crate::frame::{Command, DeviceState};
    use pretty_assertions::assert_eq;

    fn feed(parser: &mut FrameParser, bytes: &[u8]) -> Vec<ParseEvent> {
        bytes
            .iter()
            .map(|b| parser.push(*b))
            .filter(|e| *e != ParseEvent::Pending)
            .collect()
    }

    #[test]
    fn test_parse_wifi_settings() {
        let mut parser = FrameParser::new();
        let frame = encode_wifi_settings("test", "secret").unwrap();
        let events = feed(&mut parser, &frame);

        assert_eq!(events.len(), 1);
        match &events[0] {
            ParseEvent::Frame(raw) => {
                assert_eq!(raw.command, Command::WifiSettings as u8);
                assert_eq!(raw.data[0] as usize, raw.data.len() - 1);
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(!parser.in_frame());
    }

    #[test]
    fn test_command_without_payload() {
        let mut parser = FrameParser::new();
        let frame = encode_rpc_command(Command::RequestCurrentState, &[]).unwrap();
        let events = feed(&mut parser, &frame);
        assert_eq!(
            events,
            vec![ParseEvent::Frame(RawCommand {
                command: 0x02,
                data: vec![],
            })]
        );
    }

    #[test]
    fn test_noise_before_frame_is_skipped() {
        let mut parser = FrameParser::new();
        let mut bytes = b"boot log line\r\nIMPRIMP".to_vec();
        bytes.extend(encode_rpc_command(Command::RequestDeviceInfo, &[]).unwrap());
        let events = feed(&mut parser, &bytes);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ParseEvent::Frame(raw) if raw.command == 0x03));
    }

    #[test]
    fn test_header_resync_on_repeated_i() {
        let mut parser = FrameParser::new();
        let mut bytes = b"II".to_vec();
        bytes.extend(encode_rpc_command(Command::RequestCurrentState, &[]).unwrap()[1..].iter());
        let events = feed(&mut parser, &bytes);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_checksum_mismatch_reported() {
        let mut parser = FrameParser::new();
        let mut frame = encode_wifi_settings("test", "").unwrap();
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);
        let events = feed(&mut parser, &frame);
        assert!(matches!(events[..], [ParseEvent::ChecksumMismatch { .. }]));
        assert_eq!(parser.state(), ParseState::WaitHeader { matched: 0 });
    }

    #[test]
    fn test_outbound_frame_types_dropped() {
        let mut parser = FrameParser::new();
        let events = feed(&mut parser, &encode_state(DeviceState::Authorized));
        assert_eq!(
            events,
            vec![ParseEvent::Rejected(RejectReason::FrameType(0x01))]
        );
    }

    #[test]
    fn test_bad_version_dropped() {
        let mut parser = FrameParser::new();
        let events = feed(&mut parser, b"IMPROV\x02");
        assert_eq!(events, vec![ParseEvent::Rejected(RejectReason::Version(2))]);
    }

    #[test]
    fn test_oversized_length_dropped() {
        let mut parser = FrameParser::new();
        let events = feed(&mut parser, b"IMPROV\x01\x03\xC8");
        assert_eq!(events, vec![ParseEvent::Rejected(RejectReason::Length(200))]);

        let events = feed(&mut parser, b"IMPROV\x01\x03\x00");
        assert_eq!(events, vec![ParseEvent::Rejected(RejectReason::Length(0))]);
    }

    #[test]
    fn test_full_buffer_accepted() {
        let mut parser = FrameParser::new();
        let data = vec![0xAA; PAYLOAD_CAPACITY];
        let frame = encode_rpc_command(Command::WifiSettings, &data).unwrap();
        let events = feed(&mut parser, &frame);
        assert!(matches!(&events[..], [ParseEvent::Frame(raw)] if raw.data.len() == PAYLOAD_CAPACITY));
    }

    #[test]
    fn test_partial_frame_times_out() {
        let mut parser = FrameParser::new();
        feed(&mut parser, b"IMPROV\x01\x03\x05\x01");
        assert_eq!(parser.state(), ParseState::ReadPayload);

        for _ in 0..IDLE_TICK_LIMIT - 1 {
            assert!(!parser.idle_tick());
        }
        assert!(parser.idle_tick());
        assert!(!parser.in_frame());

        // Idle ticks outside a frame do nothing
        assert!(!parser.idle_tick());
    }

    #[test]
    fn test_byte_resets_idle_budget() {
        let mut parser = FrameParser::new();
        feed(&mut parser, b"IMP");
        for _ in 0..200 {
            parser.idle_tick();
        }
        parser.push(b'R');
        for _ in 0..200 {
            assert!(!parser.idle_tick());
        }
        assert_eq!(parser.state(), ParseState::WaitHeader { matched: 4 });
    }
}
