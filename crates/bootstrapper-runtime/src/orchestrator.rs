//! Boot sequence and steady-state loop.
//!
//! [`Bootstrapper`] takes a device from power-on to a steady, connected
//! state:
//!
//! ```text
//! Init ─┬─ config ──▶ LoadNetwork ─▶ NetworkUp ─▶ MessagingAttached? ─▶ Steady
//!       └─ none ────▶ EnterProvisioning
//! ```
//!
//! Every steady tick runs, in order: watchdog, serial provisioning (when
//! enabled after boot), link reconnect, gateway keep-alive, firmware-update
//! events, broker session. In provisioning mode only the watchdog, serial
//! provisioning and captive-portal submissions are serviced. Blocking loops
//! inside a tick feed the watchdog on every wait quantum.
//!
//! A restart request (new credentials, portal submission) ends the loop with
//! [`BootPhase::Restarting`]; the platform is expected to reboot, or on a
//! host to build a fresh bootstrapper.

use crate::error::BootError;
use crate::portal::PortalSource;
use crate::provisioning::{DeviceIdentity, ProvisioningContext, ProvisioningOutcome, ProvisioningService};
use crate::settings::Settings;
use crate::updates::UpdateService;
use bootstrapper_core::{
    AddressMode, BrokerError, BrokerSession, BrokerTransport, ByteStream, Clock, ConfigStore,
    ConnectivityManager, DeviceConfig, DeviceHooks, Escalation, FirmwareUpdater, InboundMessage,
    LinkDriver, LinkProfile, PublishOutcome, QoS, ServicedHooks, Subscription, SystemControl,
    UpdateOptions, Watchdog, WifiCredentials, WifiProfile,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Time payload meaning "no time yet".
pub const NO_TIME: &str = "OFF";

/// Boot phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    Init,
    LoadNetwork,
    EnterProvisioning,
    NetworkUp,
    MessagingAttached,
    Steady,
    Restarting,
}

/// Platform collaborators handed to the bootstrapper.
pub struct Platform {
    pub link: Box<dyn LinkDriver>,
    pub broker: Box<dyn BrokerTransport>,
    pub store: Box<dyn ConfigStore>,
    pub clock: Arc<dyn Clock>,
    pub watchdog: Box<dyn Watchdog>,
    pub system: Box<dyn SystemControl>,
    pub updater: Box<dyn FirmwareUpdater>,
    /// Serial console carrying provisioning frames.
    pub console: Option<Box<dyn ByteStream>>,
    /// Captive-portal submissions.
    pub portal: Option<Box<dyn PortalSource>>,
}

/// Device bootstrapper.
pub struct Bootstrapper {
    settings: Settings,
    hooks: Box<dyn DeviceHooks>,
    store: Box<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    watchdog: Box<dyn Watchdog>,
    system: Box<dyn SystemControl>,
    link: ConnectivityManager<Box<dyn LinkDriver>>,
    transport: Option<Box<dyn BrokerTransport>>,
    session: Option<BrokerSession<Box<dyn BrokerTransport>>>,
    updates: UpdateService,
    provisioning: Option<ProvisioningService>,
    portal: Option<Box<dyn PortalSource>>,
    config: Option<DeviceConfig>,
    phase: BootPhase,
    /// Last time received from the home-automation server.
    date_time: Option<String>,
    last_ping: Option<DateTime<Utc>>,
}

/// Hooks handed to the broker session: watchdog feeding plus the time topic.
struct SessionHooks<'a> {
    serviced: ServicedHooks<'a>,
    time_topic: Option<&'a str>,
    date_time: &'a mut Option<String>,
}

impl DeviceHooks for SessionHooks<'_> {
    fn on_disconnect(&mut self, escalation: Escalation) {
        self.serviced.on_disconnect(escalation)
    }

    fn on_subscribe(&mut self) -> Vec<Subscription> {
        let mut subscriptions = self.serviced.on_subscribe();
        if let Some(topic) = self.time_topic {
            if !subscriptions.iter().any(|s| s.topic == topic) {
                subscriptions.push(Subscription::new(topic, QoS::AtMostOnce));
            }
        }
        subscriptions
    }

    fn on_hardware_event(&mut self) {
        self.serviced.on_hardware_event()
    }

    fn on_message(&mut self, message: &InboundMessage) {
        if self.time_topic == Some(message.topic.as_str()) {
            *self.date_time = parse_date_time(&message.payload_str());
        }
        self.serviced.on_message(message)
    }
}

fn parse_date_time(value: &str) -> Option<String> {
    let value = value.trim().trim_matches('"');
    (!value.is_empty() && value != NO_TIME).then(|| value.to_string())
}

impl Bootstrapper {
    pub fn new(platform: Platform, settings: Settings, hooks: Box<dyn DeviceHooks>) -> Self {
        // Placeholder until a record is loaded; never started as-is.
        let idle_profile = LinkProfile::Wireless(WifiProfile {
            hostname: settings.base_device_name.clone(),
            credentials: WifiCredentials {
                ssid: String::new(),
                passphrase: String::new(),
            },
            addressing: AddressMode::Dhcp,
        });
        let link = ConnectivityManager::new(
            platform.link,
            idle_profile,
            settings.retry,
            platform.clock.clone(),
        );
        let identity = DeviceIdentity {
            firmware_tag: settings.fixed_firmware_tag(),
            firmware_version: settings.firmware_version.clone(),
            hardware_family: settings.hardware_family.clone(),
            base_name: settings.base_device_name.clone(),
        };
        let provisioning = platform.console.map(|console| {
            ProvisioningService::new(console, identity, settings.join_quanta, platform.clock.clone())
        });

        Self {
            hooks,
            store: platform.store,
            clock: platform.clock,
            watchdog: platform.watchdog,
            system: platform.system,
            link,
            transport: Some(platform.broker),
            session: None,
            updates: UpdateService::new(platform.updater),
            provisioning,
            portal: platform.portal,
            config: None,
            phase: BootPhase::Init,
            date_time: None,
            last_ping: None,
            settings,
        }
    }

    /// Run the boot sequence up to `Steady` or `EnterProvisioning`.
    pub fn setup(&mut self) -> Result<BootPhase, BootError> {
        self.phase = BootPhase::Init;
        let config = match self.settings.preset.clone() {
            Some(preset) => {
                info!(device = %preset.device_name, "Using built-in configuration");
                Some(preset)
            }
            None => self.store.configured(),
        };

        let Some(config) = config else {
            info!("No configuration, entering provisioning mode");
            self.phase = BootPhase::EnterProvisioning;
            return Ok(self.phase);
        };

        self.phase = BootPhase::LoadNetwork;
        self.link.reconfigure(LinkProfile::from_config(&config));
        let address = self
            .link
            .acquire(&mut ServicedHooks::new(self.hooks.as_mut(), self.watchdog.as_mut()))?;
        self.phase = BootPhase::NetworkUp;
        self.last_ping = Some(self.clock.now());
        info!(device = %config.device_name, %address, "Network up");

        self.updates.start(&UpdateOptions {
            hostname: config.device_name.clone(),
            port: self.settings.update_port,
            passphrase: config
                .update_passphrase_or(&self.settings.default_update_passphrase)
                .to_string(),
        });

        match (&config.broker, self.transport.take()) {
            (Some(broker), Some(transport)) => {
                let mut session = BrokerSession::new(
                    transport,
                    broker.clone(),
                    config.device_name.clone(),
                    self.settings.retry,
                    self.clock.clone(),
                )
                .with_will(self.settings.will.clone())
                .blocking(self.settings.blocking_broker);
                session.connect(
                    &self.link,
                    &mut SessionHooks {
                        serviced: ServicedHooks::new(self.hooks.as_mut(), self.watchdog.as_mut()),
                        time_topic: self.settings.time_topic.as_deref(),
                        date_time: &mut self.date_time,
                    },
                );
                self.session = Some(session);
                self.phase = BootPhase::MessagingAttached;
            }
            (None, transport) => {
                info!("Skip MQTT connection.");
                self.transport = transport;
            }
            (Some(_), None) => warn!("Broker configured but transport already in use"),
        }

        self.config = Some(config);
        self.phase = BootPhase::Steady;
        Ok(self.phase)
    }

    /// One pass of the main loop.
    pub fn tick(&mut self) -> Result<BootPhase, BootError> {
        match self.phase {
            BootPhase::Init => self.setup(),
            BootPhase::Restarting => Ok(self.phase),
            BootPhase::EnterProvisioning => {
                self.watchdog.feed();
                self.service_provisioning();
                self.service_portal();
                Ok(self.phase)
            }
            _ => {
                self.watchdog.feed();
                if self.settings.provisioning_after_boot {
                    self.service_provisioning();
                    if self.phase == BootPhase::Restarting {
                        return Ok(self.phase);
                    }
                }
                if !self.link.is_up() {
                    self.link
                        .reconnect(&mut ServicedHooks::new(self.hooks.as_mut(), self.watchdog.as_mut()))?;
                }
                self.keep_alive();
                self.updates.service(self.watchdog.as_mut());
                if let Some(session) = self.session.as_mut() {
                    session.tick(
                        &self.link,
                        &mut SessionHooks {
                            serviced: ServicedHooks::new(self.hooks.as_mut(), self.watchdog.as_mut()),
                            time_topic: self.settings.time_topic.as_deref(),
                            date_time: &mut self.date_time,
                        },
                    );
                }
                Ok(self.phase)
            }
        }
    }

    /// Tick until `shutdown` is set or a restart is requested.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<BootPhase, BootError> {
        if self.phase == BootPhase::Init {
            self.setup()?;
        }
        while !shutdown.load(Ordering::Relaxed) && self.phase != BootPhase::Restarting {
            self.tick()?;
            self.clock.sleep(self.settings.tick_interval);
        }
        if let Some(session) = self.session.as_mut() {
            session.shutdown();
        }
        Ok(self.phase)
    }

    fn service_provisioning(&mut self) {
        let Some(service) = self.provisioning.as_mut() else {
            return;
        };
        let mut hooks = ServicedHooks::new(self.hooks.as_mut(), self.watchdog.as_mut());
        let ctx = ProvisioningContext {
            store: self.store.as_ref(),
            link: &mut self.link,
            system: self.system.as_mut(),
            hooks: &mut hooks,
            device_name: self.config.as_ref().map(|c| c.device_name.as_str()),
        };
        if let ProvisioningOutcome::Restarting { joined } = service.poll(ctx) {
            debug!(?joined, "Provisioning requested restart");
            self.phase = BootPhase::Restarting;
        }
    }

    /// Ping the gateway once per keep-alive interval.
    fn keep_alive(&mut self) {
        let Some(interval) = self.settings.keepalive_interval else {
            return;
        };
        let now = self.clock.now();
        let due = match self.last_ping {
            Some(last) => (now - last).to_std().map_or(true, |elapsed| elapsed >= interval),
            None => true,
        };
        if due {
            self.last_ping = Some(now);
            self.link.ping_gateway();
        }
    }

    fn service_portal(&mut self) {
        let Some(portal) = self.portal.as_mut() else {
            return;
        };
        while let Some(submission) = portal.next_submission() {
            if submission.apply(self.store.as_ref(), self.system.as_mut()).is_ok() {
                self.phase = BootPhase::Restarting;
                return;
            }
        }
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    pub fn publish(&mut self, topic: &str, payload: &[u8], retained: bool) -> PublishOutcome {
        match self.session.as_mut() {
            Some(session) => session.publish(topic, payload, retained),
            None => PublishOutcome::Dropped,
        }
    }

    pub fn publish_json(&mut self, topic: &str, value: &Value, retained: bool) -> PublishOutcome {
        self.publish(topic, value.to_string().as_bytes(), retained)
    }

    pub fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), BrokerError> {
        self.session
            .as_mut()
            .ok_or(BrokerError::NotConnected)?
            .subscribe(topic, qos)
    }

    pub fn unsubscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.session
            .as_mut()
            .ok_or(BrokerError::NotConnected)?
            .unsubscribe(topic)
    }

    /// Publish a retained device-state document.
    ///
    /// `state` is extended with `Whoami`, `IP`, `MAC`, `ver`, `time` and `wifi`.
    /// Dropped until a time has been received, so retained values never
    /// carry an unknown timestamp.
    pub fn publish_state(&mut self, topic: &str, state: Value, version: &str) -> PublishOutcome {
        let Some(time) = self.date_time.clone() else {
            debug!(%topic, "No time received yet, state not published");
            return PublishOutcome::Dropped;
        };
        let mut document = match state {
            Value::Object(map) => map,
            Value::Null => Default::default(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let name = self
            .config
            .as_ref()
            .map(|c| c.device_name.clone())
            .unwrap_or_default();
        let address = self
            .link
            .address()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let quality = self.link.signal_quality().map(i32::from).unwrap_or(-1);

        document.insert("Whoami".to_string(), json!(name));
        document.insert("IP".to_string(), json!(address));
        document.insert("MAC".to_string(), json!(self.link.mac_address().unwrap_or_default()));
        document.insert("ver".to_string(), json!(version));
        document.insert("time".to_string(), json!(time));
        document.insert("wifi".to_string(), json!(quality));
        self.publish_json(topic, &Value::Object(document), true)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Record the time pushed by the home-automation server.
    ///
    /// `OFF` clears it.
    pub fn set_date_time(&mut self, value: &str) {
        self.date_time = parse_date_time(value);
    }

    /// `YYYY-MM-DDTHH:MM...` as last received.
    pub fn date_time(&self) -> Option<&str> {
        self.date_time.as_deref()
    }

    pub fn phase(&self) -> BootPhase {
        self.phase
    }

    pub fn config(&self) -> Option<&DeviceConfig> {
        self.config.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn link(&self) -> &ConnectivityManager<Box<dyn LinkDriver>> {
        &self.link
    }

    pub fn session(&self) -> Option<&BrokerSession<Box<dyn BrokerTransport>>> {
        self.session.as_ref()
    }

    pub fn messaging_enabled(&self) -> bool {
        self.session.is_some()
    }
}
