//! Host implementations of the platform traits.
//!
//! The host has no radio and no firmware partition. The link driver reports
//! the address of the default route, the broker transport is a dry run that
//! checks the broker is reachable and refuses to carry traffic, and the serial
//! console reads provisioning frames from a real port.

use bootstrapper_core::{
    BrokerError, BrokerTransport, ByteStream, ConnectOptions, DeviceHooks, Escalation,
    FirmwareUpdater, InboundMessage, LinkDriver, LinkError, LinkProfile, QoS, SystemControl,
    UpdateError, UpdateEvent, UpdateOptions, Watchdog,
};
use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Address used only to select the outbound interface; nothing is sent.
const ROUTE_PROBE: &str = "192.0.2.1:9";

const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

// ============================================================================
// Link
// ============================================================================

/// Link backed by the host's default route.
#[derive(Debug, Default)]
pub struct HostLink {
    profile: Option<LinkProfile>,
}

impl HostLink {
    pub fn new() -> Self {
        Self::default()
    }

    fn route_address() -> Option<Ipv4Addr> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect(ROUTE_PROBE).ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(address) if !address.is_unspecified() => Some(address),
            _ => None,
        }
    }
}

impl LinkDriver for HostLink {
    fn begin(&mut self, profile: &LinkProfile) -> Result<(), LinkError> {
        info!(hostname = %profile.hostname(), wired = profile.is_wired(), "Host link started");
        self.profile = Some(profile.clone());
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.profile.is_some() && Self::route_address().is_some()
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.profile.as_ref().and(Self::route_address())
    }

    fn rssi(&self) -> Option<i32> {
        None
    }

    fn rejoin(&mut self) -> Result<(), LinkError> {
        if self.profile.is_none() {
            return Err(LinkError::NotStarted);
        }
        debug!("Host link rejoin requested");
        Ok(())
    }

    fn disconnect(&mut self) {
        self.profile = None;
    }
}

// ============================================================================
// Broker
// ============================================================================

/// Dry-run broker transport.
///
/// `connect` succeeds when the broker accepts a TCP connection, so the
/// retry and escalation paths run against a real endpoint. Nothing is sent:
/// publishes and subscriptions fail with a transport error and are reported
/// as dropped.
#[derive(Debug, Default)]
pub struct DryRunBroker {
    connected: bool,
}

impl DryRunBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BrokerTransport for DryRunBroker {
    fn connect(&mut self, options: &ConnectOptions) -> Result<(), BrokerError> {
        let address = SocketAddr::from((options.address, options.port));
        TcpStream::connect_timeout(&address, BROKER_CONNECT_TIMEOUT)
            .map_err(|e| BrokerError::ConnectFailed(e.to_string()))?;
        info!(%address, client_id = %options.client_id, will = options.will.is_some(), "Broker reachable");
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), BrokerError> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        debug!(%topic, retain, payload = %String::from_utf8_lossy(payload), "Dry run, publish not sent");
        Err(BrokerError::Transport("dry-run transport does not publish".to_string()))
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        debug!(%topic, ?qos, "Dry run, subscribe not sent");
        Err(BrokerError::Transport("dry-run transport does not subscribe".to_string()))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        Err(BrokerError::Transport("dry-run transport does not subscribe".to_string()))
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        Vec::new()
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

// ============================================================================
// Serial console
// ============================================================================

/// Provisioning console over a serial port.
pub struct SerialConsole {
    port: Box<dyn SerialPort>,
    pending: VecDeque<u8>,
}

impl SerialConsole {
    pub fn open(path: &str, baud: u32) -> anyhow::Result<Self> {
        use anyhow::Context;

        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(1))
            .open()
            .with_context(|| format!("failed to open serial port {path} @ {baud}"))?;
        Ok(Self {
            port,
            pending: VecDeque::new(),
        })
    }

    fn fill(&mut self) {
        let mut buf = [0u8; 64];
        match self.port.read(&mut buf) {
            Ok(n) => self.pending.extend(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::TimedOut => {}
            Err(e) => warn!(error = %e, "Serial read failed"),
        }
    }
}

impl ByteStream for SerialConsole {
    fn try_read(&mut self) -> Option<u8> {
        if self.pending.is_empty() {
            self.fill();
        }
        self.pending.pop_front()
    }

    fn write(&mut self, bytes: &[u8]) {
        if let Err(e) = self.port.write_all(bytes).and_then(|()| self.port.flush()) {
            warn!(error = %e, "Serial write failed");
        }
    }
}

// ============================================================================
// System
// ============================================================================

/// Restart requests end the current boot; the runner starts a fresh one.
#[derive(Debug, Clone, Default)]
pub struct HostSystem {
    restart_requested: Arc<AtomicBool>,
}

impl HostSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a pending restart request.
    pub fn take_restart(&self) -> bool {
        self.restart_requested.swap(false, Ordering::SeqCst)
    }
}

impl SystemControl for HostSystem {
    fn restart(&mut self) {
        info!("Restart requested");
        self.restart_requested.store(true, Ordering::SeqCst);
    }
}

impl Watchdog for HostSystem {
    fn feed(&mut self) {}
}

/// The host never accepts firmware images.
#[derive(Debug, Default)]
pub struct NoUpdates;

impl FirmwareUpdater for NoUpdates {
    fn begin(&mut self, options: &UpdateOptions) -> Result<(), UpdateError> {
        Err(UpdateError::Unavailable(format!(
            "no update listener on host (would listen on {}:{})",
            options.hostname, options.port
        )))
    }

    fn poll(&mut self) -> Option<UpdateEvent> {
        None
    }
}

/// Hooks that log what a device would react to.
#[derive(Debug, Default)]
pub struct LoggingHooks;

impl DeviceHooks for LoggingHooks {
    fn on_disconnect(&mut self, escalation: Escalation) {
        warn!(?escalation, "Connection escalation");
    }

    fn on_message(&mut self, message: &InboundMessage) {
        info!(topic = %message.topic, payload = %message.payload_str(), "Message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_down_until_started() {
        let link = HostLink::new();
        assert!(!link.is_up());
        assert!(link.local_address().is_none());
    }

    #[test]
    fn test_rejoin_requires_start() {
        let mut link = HostLink::new();
        assert!(matches!(link.rejoin(), Err(LinkError::NotStarted)));
    }

    #[test]
    fn test_dry_run_broker_publish_requires_connection() {
        let mut broker = DryRunBroker::new();
        assert!(matches!(
            broker.publish("t", b"x", false),
            Err(BrokerError::NotConnected)
        ));
    }

    #[test]
    fn test_dry_run_broker_never_reports_delivery() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut broker = DryRunBroker::new();
        let options = ConnectOptions {
            address: Ipv4Addr::LOCALHOST,
            port,
            client_id: "dev".to_string(),
            credentials: None,
            will: None,
            clean_session: true,
        };

        broker.connect(&options).unwrap();
        assert!(broker.is_connected());
        assert!(matches!(
            broker.publish("dev/state", b"{}", true),
            Err(BrokerError::Transport(_))
        ));
        assert!(broker.subscribe("dev/set", QoS::AtMostOnce).is_err());
        assert!(broker.poll().is_empty());
    }

    #[test]
    fn test_restart_request_consumed_once() {
        let system = HostSystem::new();
        let mut handle = system.clone();
        handle.restart();
        assert!(system.take_restart());
        assert!(!system.take_restart());
    }

    #[test]
    fn test_no_updates_reports_unavailable() {
        let mut updater = NoUpdates;
        let options = UpdateOptions {
            hostname: "dev".to_string(),
            port: 8199,
            passphrase: String::new(),
        };
        assert!(matches!(updater.begin(&options), Err(UpdateError::Unavailable(_))));
    }
}
