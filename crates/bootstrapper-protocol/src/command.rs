//! RPC command payload decoding.

use crate::frame::{Command, MAX_PASSPHRASE_LEN, MAX_SSID_LEN};
use crate::parser::RawCommand;
use thiserror::Error;

/// Errors decoding an RPC command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Command id not understood; answered with `UnknownRpc`.
    #[error("Unknown RPC command {0:#04x}")]
    UnknownCommand(u8),

    /// Payload shorter than its length fields claim.
    #[error("Truncated RPC payload")]
    Truncated,

    #[error("SSID length {0} outside 1..={max}", max = MAX_SSID_LEN)]
    SsidLength(usize),

    #[error("Passphrase length {0} exceeds {max}", max = MAX_PASSPHRASE_LEN)]
    PassphraseLength(usize),

    #[error("Credentials are not valid UTF-8")]
    InvalidUtf8,
}

impl CommandError {
    /// Whether the command id itself was the problem, as opposed to its payload.
    pub fn is_unknown_command(&self) -> bool {
        matches!(self, CommandError::UnknownCommand(_))
    }
}

/// A decoded RPC command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcCommand {
    SetWifi { ssid: String, passphrase: String },
    RequestCurrentState,
    RequestDeviceInfo,
}

impl RpcCommand {
    /// Decode a command id and its data bytes.
    ///
    /// `WifiSettings` data is `[total_len, ssid_len, ssid.., pass_len?, pass..]`.
    /// A missing passphrase block means an open network.
    pub fn parse(command: u8, data: &[u8]) -> Result<Self, CommandError> {
        match Command::try_from(command).map_err(CommandError::UnknownCommand)? {
            Command::WifiSettings => parse_wifi_settings(data),
            Command::RequestCurrentState => Ok(RpcCommand::RequestCurrentState),
            Command::RequestDeviceInfo => Ok(RpcCommand::RequestDeviceInfo),
        }
    }

    pub fn command(&self) -> Command {
        match self {
            RpcCommand::SetWifi { .. } => Command::WifiSettings,
            RpcCommand::RequestCurrentState => Command::RequestCurrentState,
            RpcCommand::RequestDeviceInfo => Command::RequestDeviceInfo,
        }
    }
}

impl TryFrom<&RawCommand> for RpcCommand {
    type Error = CommandError;

    fn try_from(raw: &RawCommand) -> Result<Self, Self::Error> {
        RpcCommand::parse(raw.command, &raw.data)
    }
}

fn parse_wifi_settings(data: &[u8]) -> Result<RpcCommand, CommandError> {
    let (&total, rest) = data.split_first().ok_or(CommandError::Truncated)?;
    let body = rest.get(..total as usize).ok_or(CommandError::Truncated)?;

    let (&ssid_len, rest) = body.split_first().ok_or(CommandError::SsidLength(0))?;
    let ssid_len = ssid_len as usize;
    if ssid_len == 0 || ssid_len > MAX_SSID_LEN {
        return Err(CommandError::SsidLength(ssid_len));
    }
    let ssid = rest.get(..ssid_len).ok_or(CommandError::Truncated)?;
    let rest = &rest[ssid_len..];

    let passphrase = match rest.split_first() {
        None => &[][..],
        Some((&pass_len, tail)) => {
            let pass_len = pass_len as usize;
            if pass_len > MAX_PASSPHRASE_LEN {
                return Err(CommandError::PassphraseLength(pass_len));
            }
            tail.get(..pass_len).ok_or(CommandError::Truncated)?
        }
    };

    Ok(RpcCommand::SetWifi {
        ssid: String::from_utf8(ssid.to_vec()).map_err(|_| CommandError::InvalidUtf8)?,
        passphrase: String::from_utf8(passphrase.to_vec()).map_err(|_| CommandError::InvalidUtf8)?,
    })
}
