//! Serial provisioning service.
//!
//! Reads provisioning frames from the console stream and answers them.
//! The interesting command is `WifiSettings`: it replaces the stored record
//! with a fresh DHCP configuration, tries to join, reports the outcome and
//! restarts the device. The restart happens whether or not the join worked;
//! a device that cannot join comes back up and retries from the stored
//! record.

use bootstrapper_core::{
    ByteStream, Clock, ConfigStore, ConnectivityManager, DeviceConfig, DeviceHooks, LinkDriver,
    LinkProfile, SystemControl,
};
use bootstrapper_protocol::{
    encode_error, encode_rpc_response, encode_state, Command, DeviceState, ErrorCode, FrameParser,
    ParseEvent, RawCommand, RpcCommand,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Polling interval while waiting for the rest of a frame.
const IDLE_TICK: Duration = Duration::from_millis(1);

/// Strings reported by `RequestDeviceInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Exactly four bytes.
    pub firmware_tag: String,
    pub firmware_version: String,
    pub hardware_family: String,
    /// Prefix for the name of freshly provisioned devices.
    pub base_name: String,
}

/// What the device looks like to the provisioning service right now.
pub struct ProvisioningContext<'a, L> {
    pub store: &'a dyn ConfigStore,
    pub link: &'a mut ConnectivityManager<L>,
    pub system: &'a mut dyn SystemControl,
    pub hooks: &'a mut dyn DeviceHooks,
    /// Name of the running configuration, `None` while unconfigured.
    pub device_name: Option<&'a str>,
}

/// Result of one service pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningOutcome {
    /// Nothing complete arrived.
    Idle,
    /// A command was answered.
    Answered(Command),
    /// A malformed frame or command was answered with an error frame.
    Rejected(ErrorCode),
    /// New credentials were stored and a restart was requested.
    Restarting { joined: Option<Ipv4Addr> },
}

/// Console provisioning endpoint.
pub struct ProvisioningService {
    parser: FrameParser,
    stream: Box<dyn ByteStream>,
    identity: DeviceIdentity,
    join_quanta: u32,
    clock: Arc<dyn Clock>,
}

impl ProvisioningService {
    pub fn new(
        stream: Box<dyn ByteStream>,
        identity: DeviceIdentity,
        join_quanta: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            parser: FrameParser::new(),
            stream,
            identity,
            join_quanta,
            clock,
        }
    }

    /// Drain the stream and answer at most one complete frame.
    ///
    /// Returns as soon as the stream is empty outside a frame. Inside a frame
    /// it keeps polling at 1 ms until the frame completes or the idle budget
    /// runs out.
    pub fn poll<L: LinkDriver>(&mut self, ctx: ProvisioningContext<'_, L>) -> ProvisioningOutcome {
        loop {
            match self.stream.try_read() {
                Some(byte) => match self.parser.push(byte) {
                    ParseEvent::Pending | ParseEvent::Rejected(_) => {}
                    ParseEvent::ChecksumMismatch { .. } => {
                        warn!("Provisioning frame checksum mismatch");
                        return self.reply_error(ErrorCode::InvalidRpc);
                    }
                    ParseEvent::Frame(raw) => return self.dispatch(&raw, ctx),
                },
                None => {
                    if !self.parser.in_frame() {
                        return ProvisioningOutcome::Idle;
                    }
                    self.clock.sleep(IDLE_TICK);
                    if self.parser.idle_tick() {
                        return ProvisioningOutcome::Idle;
                    }
                }
            }
        }
    }

    fn dispatch<L: LinkDriver>(
        &mut self,
        raw: &RawCommand,
        ctx: ProvisioningContext<'_, L>,
    ) -> ProvisioningOutcome {
        let command = match RpcCommand::try_from(raw) {
            Ok(command) => command,
            Err(e) if e.is_unknown_command() => {
                debug!(command = raw.command, "Unknown provisioning command");
                return self.reply_error(ErrorCode::UnknownRpc);
            }
            Err(e) => {
                warn!(error = %e, "Invalid provisioning command");
                return self.reply_error(ErrorCode::InvalidRpc);
            }
        };

        match command {
            RpcCommand::RequestCurrentState => {
                self.report_state(&ctx);
                ProvisioningOutcome::Answered(Command::RequestCurrentState)
            }
            RpcCommand::RequestDeviceInfo => {
                let identity = self.identity.clone();
                let name = ctx.device_name.unwrap_or(&identity.firmware_tag);
                self.reply_rpc(
                    Command::RequestDeviceInfo,
                    &[
                        &identity.firmware_tag,
                        &identity.firmware_version,
                        &identity.hardware_family,
                        name,
                    ],
                );
                ProvisioningOutcome::Answered(Command::RequestDeviceInfo)
            }
            RpcCommand::SetWifi { ssid, passphrase } => self.apply_credentials(&ssid, &passphrase, ctx),
        }
    }

    fn report_state<L: LinkDriver>(&mut self, ctx: &ProvisioningContext<'_, L>) {
        if ctx.device_name.is_none() {
            self.stream.write(&encode_state(DeviceState::Authorized));
            return;
        }
        match ctx.link.address() {
            Some(address) => {
                self.stream.write(&encode_state(DeviceState::Provisioned));
                self.reply_rpc(Command::RequestCurrentState, &[&device_url(address)]);
            }
            None => self.stream.write(&encode_state(DeviceState::Provisioning)),
        }
    }

    fn apply_credentials<L: LinkDriver>(
        &mut self,
        ssid: &str,
        passphrase: &str,
        ctx: ProvisioningContext<'_, L>,
    ) -> ProvisioningOutcome {
        self.stream.write(&encode_state(DeviceState::Provisioning));

        let name = provisioned_name(&self.identity.base_name);
        let config = DeviceConfig::for_wifi(&name, ssid, passphrase);
        if let Err(e) = ctx.store.save(&config) {
            error!(error = %e, "Unable to store credentials");
            return self.reply_error(ErrorCode::Unknown);
        }
        info!(device = %name, %ssid, "Credentials received, joining");

        ctx.link.reconfigure(LinkProfile::from_config(&config));
        let joined = ctx.link.join(self.join_quanta, ctx.hooks);
        match joined {
            Some(address) => {
                self.reply_rpc(Command::WifiSettings, &[&device_url(address)]);
                self.stream.write(&encode_state(DeviceState::Provisioned));
            }
            None => warn!(%ssid, "Join did not complete, restarting anyway"),
        }

        ctx.system.restart();
        ProvisioningOutcome::Restarting { joined }
    }

    fn reply_rpc(&mut self, command: Command, strings: &[&str]) {
        match encode_rpc_response(command, strings) {
            Ok(frame) => self.stream.write(&frame),
            Err(e) => error!(error = %e, "Unable to encode provisioning response"),
        }
    }

    fn reply_error(&mut self, code: ErrorCode) -> ProvisioningOutcome {
        self.stream.write(&encode_error(code));
        ProvisioningOutcome::Rejected(code)
    }
}

/// URL at which a provisioned device can be reached.
pub fn device_url(address: Ipv4Addr) -> String {
    format!("http://{address}")
}

/// Base name plus a random five-digit suffix.
fn provisioned_name(base: &str) -> String {
    let suffix = uuid::Uuid::new_v4().as_u128() % 100_000;
    format!("{base}_{suffix}")
}
