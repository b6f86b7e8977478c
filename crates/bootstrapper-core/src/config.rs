//! Persisted device configuration.
//!
//! The device keeps a single JSON record (`setup.json`) describing how it
//! joins the network and, optionally, a message broker. The record is either
//! absent (the device is unconfigured and boots into provisioning) or fully
//! valid for its addressing mode.
//!
//! Two representations are kept apart:
//! - [`DeviceConfigRecord`] mirrors the file byte-for-byte (stringly typed,
//!   every key optional) so files written by older firmware keep loading.
//! - [`DeviceConfig`] is the validated, typed record the runtime works with.
//!
//! Storage is abstracted behind [`ConfigStore`] so the same logic runs
//! against a flash filesystem on the device and a plain file on a host.

use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default file name of the persisted record.
pub const CONFIG_FILE_NAME: &str = "setup.json";

/// Marker stored in `microcontrollerIP` when the address comes from DHCP.
pub const DHCP_MARKER: &str = "DHCP";

/// Wired profile indexes at or above this value select an SPI controller.
pub const SPI_START_INDEX: u8 = 100;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The requested configuration was not found.
    #[error("Configuration not found: {0}")]
    NotFound(String),

    /// A key required for the record to be valid is missing or empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Failed to read configuration.
    #[error("Read error: {0}")]
    ReadError(String),

    /// Failed to write configuration.
    #[error("Write error: {0}")]
    WriteError(String),

    /// Configuration data is invalid.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Storage is not available.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

// ============================================================================
// On-disk record
// ============================================================================

/// The configuration file exactly as stored.
///
/// Key names are kept compatible with records written by the captive portal
/// of earlier firmware, which is why they do not follow a single casing rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfigRecord {
    #[serde(rename = "deviceName", default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    /// `"DHCP"` or a dotted IPv4 address.
    #[serde(rename = "microcontrollerIP", default, skip_serializing_if = "Option::is_none")]
    pub microcontroller_ip: Option<String>,

    #[serde(rename = "gatewayIP", default, skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<String>,

    #[serde(rename = "subnetMask", default, skip_serializing_if = "Option::is_none")]
    pub subnet_mask: Option<String>,

    #[serde(rename = "dnsIP", default, skip_serializing_if = "Option::is_none")]
    pub dns_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qsid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qpass: Option<String>,

    #[serde(rename = "OTApass", default, skip_serializing_if = "Option::is_none")]
    pub ota_pass: Option<String>,

    #[serde(rename = "mqttIP", default, skip_serializing_if = "Option::is_none")]
    pub mqtt_ip: Option<String>,

    /// Written as a string by the portal; numbers are accepted on read.
    #[serde(
        rename = "mqttPort",
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub mqtt_port: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqttuser: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqttpass: Option<String>,

    /// Wired profile index, negative when unused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ethd: Option<i8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mosi: Option<i8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miso: Option<i8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sclk: Option<i8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cs: Option<i8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int: Option<i8>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rst: Option<i8>,

    #[serde(rename = "additionalParam", default, skip_serializing_if = "Option::is_none")]
    pub additional_param: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    }))
}

// ============================================================================
// Validated record
// ============================================================================

/// Station credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub passphrase: String,
}

/// Fixed addressing for the station interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticAddress {
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub dns: Ipv4Addr,
}

/// How the device obtains its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    Dhcp,
    Static(StaticAddress),
}

/// Broker endpoint and optional credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub address: Ipv4Addr,
    pub port: u16,
    pub user: String,
    pub passphrase: String,
}

impl BrokerConfig {
    /// Both user and passphrase empty means an anonymous connect.
    pub fn is_anonymous(&self) -> bool {
        self.user.is_empty() && self.passphrase.is_empty()
    }
}

/// SPI pin assignment for an SPI-attached wired controller.
///
/// `interrupt` and `reset` are optional on most boards (`None` when unwired).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiPins {
    pub mosi: u8,
    pub miso: u8,
    pub sclk: u8,
    pub cs: u8,
    pub interrupt: Option<u8>,
    pub reset: Option<u8>,
}

/// Wired fallback selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WiredConfig {
    /// Board profile index into the platform pin tables.
    pub index: u8,
    /// Present when `index >= SPI_START_INDEX`.
    pub spi: Option<SpiPins>,
}

/// Validated device configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_name: String,
    pub addressing: AddressMode,
    pub wifi: WifiCredentials,
    /// Falls back to the compiled default when `None`.
    pub update_passphrase: Option<String>,
    /// `None` disables messaging entirely.
    pub broker: Option<BrokerConfig>,
    pub wired: Option<WiredConfig>,
    /// Opaque product-specific value.
    pub extension: String,
}

impl DeviceConfig {
    /// A fresh DHCP configuration carrying only station credentials.
    ///
    /// Used by the provisioning paths; broker and wired fields are left empty.
    pub fn for_wifi(device_name: &str, ssid: &str, passphrase: &str) -> Self {
        Self {
            device_name: device_name.to_string(),
            addressing: AddressMode::Dhcp,
            wifi: WifiCredentials {
                ssid: ssid.to_string(),
                passphrase: passphrase.to_string(),
            },
            update_passphrase: None,
            broker: None,
            wired: None,
            extension: String::new(),
        }
    }

    /// Whether a broker endpoint was configured.
    pub fn messaging_enabled(&self) -> bool {
        self.broker.is_some()
    }

    /// The firmware-update passphrase, or `default` when none was stored.
    pub fn update_passphrase_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.update_passphrase.as_deref().unwrap_or(default)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_ipv4(field: &'static str, value: &str) -> Result<Ipv4Addr, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidData(format!("{field}: '{value}' is not an IPv4 address")))
}

fn required_ipv4(field: &'static str, value: Option<String>) -> Result<Ipv4Addr, ConfigError> {
    let value = non_empty(value).ok_or(ConfigError::MissingField(field))?;
    parse_ipv4(field, &value)
}

fn required_pin(field: &'static str, value: Option<i8>) -> Result<u8, ConfigError> {
    match value {
        Some(pin) if pin >= 0 => Ok(pin as u8),
        Some(pin) => Err(ConfigError::InvalidData(format!("{field}: pin {pin} is not wired"))),
        None => Err(ConfigError::MissingField(field)),
    }
}

fn optional_pin(value: Option<i8>) -> Option<u8> {
    value.filter(|pin| *pin >= 0).map(|pin| pin as u8)
}

impl TryFrom<DeviceConfigRecord> for DeviceConfig {
    type Error = ConfigError;

    fn try_from(record: DeviceConfigRecord) -> Result<Self, Self::Error> {
        // The record counts as present only once station credentials exist.
        let ssid = match record.qsid {
            None => return Err(ConfigError::NotFound("qsid".to_string())),
            Some(ssid) if ssid.is_empty() => return Err(ConfigError::MissingField("qsid")),
            Some(ssid) => ssid,
        };
        let device_name =
            non_empty(record.device_name).ok_or(ConfigError::MissingField("deviceName"))?;

        let addressing = match non_empty(record.microcontroller_ip) {
            None => AddressMode::Dhcp,
            Some(ip) if ip.eq_ignore_ascii_case(DHCP_MARKER) => AddressMode::Dhcp,
            Some(ip) => AddressMode::Static(StaticAddress {
                address: parse_ipv4("microcontrollerIP", &ip)?,
                gateway: required_ipv4("gatewayIP", record.gateway_ip)?,
                subnet: required_ipv4("subnetMask", record.subnet_mask)?,
                dns: required_ipv4("dnsIP", record.dns_ip)?,
            }),
        };

        let broker = match non_empty(record.mqtt_ip) {
            None => None,
            Some(ip) => {
                let port = non_empty(record.mqtt_port).ok_or(ConfigError::MissingField("mqttPort"))?;
                let port = port
                    .trim()
                    .parse::<u16>()
                    .ok()
                    .filter(|port| *port > 0)
                    .ok_or_else(|| ConfigError::InvalidData(format!("mqttPort: '{port}' is not a port")))?;
                Some(BrokerConfig {
                    address: parse_ipv4("mqttIP", &ip)?,
                    port,
                    user: record.mqttuser.unwrap_or_default(),
                    passphrase: record.mqttpass.unwrap_or_default(),
                })
            }
        };

        let wired = match record.ethd {
            Some(index) if index >= 0 => {
                let index = index as u8;
                let spi = if index >= SPI_START_INDEX {
                    Some(SpiPins {
                        mosi: required_pin("mosi", record.mosi)?,
                        miso: required_pin("miso", record.miso)?,
                        sclk: required_pin("sclk", record.sclk)?,
                        cs: required_pin("cs", record.cs)?,
                        interrupt: optional_pin(record.int),
                        reset: optional_pin(record.rst),
                    })
                } else {
                    None
                };
                Some(WiredConfig { index, spi })
            }
            _ => None,
        };

        Ok(DeviceConfig {
            device_name,
            addressing,
            wifi: WifiCredentials {
                ssid,
                passphrase: record.qpass.unwrap_or_default(),
            },
            update_passphrase: non_empty(record.ota_pass),
            broker,
            wired,
            extension: record.additional_param.unwrap_or_default(),
        })
    }
}

impl From<&DeviceConfig> for DeviceConfigRecord {
    fn from(config: &DeviceConfig) -> Self {
        let (microcontroller_ip, gateway_ip, subnet_mask, dns_ip) = match config.addressing {
            AddressMode::Dhcp => (DHCP_MARKER.to_string(), None, None, None),
            AddressMode::Static(fixed) => (
                fixed.address.to_string(),
                Some(fixed.gateway.to_string()),
                Some(fixed.subnet.to_string()),
                Some(fixed.dns.to_string()),
            ),
        };

        // Disabled messaging is written as empty strings, like the portal does.
        let (mqtt_ip, mqtt_port, mqttuser, mqttpass) = match &config.broker {
            Some(broker) => (
                broker.address.to_string(),
                broker.port.to_string(),
                broker.user.clone(),
                broker.passphrase.clone(),
            ),
            None => Default::default(),
        };

        let spi = config.wired.and_then(|wired| wired.spi);
        let pin = |pin: Option<u8>| pin.map(|p| p as i8).unwrap_or(-1);

        DeviceConfigRecord {
            device_name: Some(config.device_name.clone()),
            microcontroller_ip: Some(microcontroller_ip),
            gateway_ip,
            subnet_mask,
            dns_ip,
            qsid: Some(config.wifi.ssid.clone()),
            qpass: Some(config.wifi.passphrase.clone()),
            ota_pass: Some(config.update_passphrase.clone().unwrap_or_default()),
            mqtt_ip: Some(mqtt_ip),
            mqtt_port: Some(mqtt_port),
            mqttuser: Some(mqttuser),
            mqttpass: Some(mqttpass),
            ethd: Some(config.wired.map(|wired| wired.index as i8).unwrap_or(-1)),
            mosi: spi.map(|s| s.mosi as i8),
            miso: spi.map(|s| s.miso as i8),
            sclk: spi.map(|s| s.sclk as i8),
            cs: spi.map(|s| s.cs as i8),
            int: spi.map(|s| pin(s.interrupt)),
            rst: spi.map(|s| pin(s.reset)),
            additional_param: Some(config.extension.clone()),
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Abstract configuration storage.
///
/// Implementations provide the platform storage mechanism:
/// - [`FileConfigStore`] for any mounted filesystem (host, SPIFFS/LittleFS VFS)
/// - [`MemoryConfigStore`] for tests and ephemeral runs
///
/// All methods are synchronous to support embedded platforms.
pub trait ConfigStore: Send {
    /// Load the raw record.
    fn load_record(&self) -> Result<DeviceConfigRecord, ConfigError>;

    /// Overwrite the raw record.
    fn save_record(&self, record: &DeviceConfigRecord) -> Result<(), ConfigError>;

    /// Check if a record exists.
    fn exists(&self) -> bool;

    /// Delete the record, returning the device to the unconfigured state.
    fn erase(&self) -> Result<(), ConfigError>;

    /// Load and validate the record.
    fn load(&self) -> Result<DeviceConfig, ConfigError> {
        DeviceConfig::try_from(self.load_record()?)
    }

    /// Validate-free save of a typed record.
    fn save(&self, config: &DeviceConfig) -> Result<(), ConfigError> {
        self.save_record(&DeviceConfigRecord::from(config))
    }

    /// Load the record, treating every failure as "unconfigured".
    fn configured(&self) -> Option<DeviceConfig> {
        match self.load() {
            Ok(config) => {
                info!(device = %config.device_name, "Storage OK, restoring WiFi and broker config");
                Some(config)
            }
            Err(ConfigError::NotFound(what)) => {
                info!(%what, "No setup file");
                None
            }
            Err(e) => {
                warn!(error = %e, "Stored configuration unusable, treating device as unconfigured");
                None
            }
        }
    }
}

impl<S: ConfigStore + ?Sized> ConfigStore for Box<S> {
    fn load_record(&self) -> Result<DeviceConfigRecord, ConfigError> {
        (**self).load_record()
    }

    fn save_record(&self, record: &DeviceConfigRecord) -> Result<(), ConfigError> {
        (**self).save_record(record)
    }

    fn exists(&self) -> bool {
        (**self).exists()
    }

    fn erase(&self) -> Result<(), ConfigError> {
        (**self).erase()
    }
}

/// JSON file storage.
///
/// Writes overwrite the file in place; there is no temporary file and rename,
/// so a crash mid-write can leave a truncated record behind. A truncated
/// record fails to parse and the device falls back to provisioning.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store `setup.json` inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(CONFIG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load_record(&self) -> Result<DeviceConfigRecord, ConfigError> {
        if !self.path.exists() {
            return Err(ConfigError::NotFound(self.path.display().to_string()));
        }
        let text = fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), bytes = text.len(), "Read configuration file");
        serde_json::from_str(&text).map_err(|e| ConfigError::InvalidData(e.to_string()))
    }

    fn save_record(&self, record: &DeviceConfigRecord) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| ConfigError::StorageUnavailable(format!("{}: {e}", parent.display())))?;
        }
        let json =
            serde_json::to_string_pretty(record).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        fs::write(&self.path, json)
            .map_err(|e| ConfigError::WriteError(format!("{}: {e}", self.path.display())))?;
        info!(path = %self.path.display(), "[setup.json] written correctly");
        Ok(())
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn erase(&self) -> Result<(), ConfigError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConfigError::WriteError(e.to_string())),
        }
    }
}

/// In-memory storage.
///
/// Clones share the same slot, so a test can hand one clone to the runtime
/// and inspect writes through another.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    inner: Arc<MemorySlot>,
}

#[derive(Debug, Default)]
struct MemorySlot {
    data: RwLock<Option<String>>,
    read_only: AtomicBool,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `config`.
    pub fn with_config(config: &DeviceConfig) -> Self {
        let store = Self::new();
        if let Err(e) = store.save(config) {
            warn!(error = %e, "Unable to seed memory store");
        }
        store
    }

    /// Make subsequent writes fail, simulating a worn or unmounted flash.
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.read_only.store(read_only, Ordering::Relaxed);
    }

    /// The stored JSON text, if any.
    pub fn raw(&self) -> Option<String> {
        self.inner.data.read().ok().and_then(|data| data.clone())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load_record(&self) -> Result<DeviceConfigRecord, ConfigError> {
        let data = self
            .inner
            .data
            .read()
            .map_err(|e| ConfigError::StorageUnavailable(e.to_string()))?;
        let json = data
            .as_ref()
            .ok_or_else(|| ConfigError::NotFound(CONFIG_FILE_NAME.to_string()))?;
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidData(e.to_string()))
    }

    fn save_record(&self, record: &DeviceConfigRecord) -> Result<(), ConfigError> {
        if self.inner.read_only.load(Ordering::Relaxed) {
            return Err(ConfigError::WriteError("storage is read-only".to_string()));
        }
        let json =
            serde_json::to_string(record).map_err(|e| ConfigError::WriteError(e.to_string()))?;
        let mut data = self
            .inner
            .data
            .write()
            .map_err(|e| ConfigError::StorageUnavailable(e.to_string()))?;
        *data = Some(json);
        Ok(())
    }

    fn exists(&self) -> bool {
        self.inner
            .data
            .read()
            .map(|data| data.is_some())
            .unwrap_or(false)
    }

    fn erase(&self) -> Result<(), ConfigError> {
        let mut data = self
            .inner
            .data
            .write()
            .map_err(|e| ConfigError::StorageUnavailable(e.to_string()))?;
        *data = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn full_record() -> DeviceConfigRecord {
        DeviceConfigRecord {
            device_name: Some("GLOW_WORM".to_string()),
            microcontroller_ip: Some("DHCP".to_string()),
            qsid: Some("home".to_string()),
            qpass: Some("secret".to_string()),
            ota_pass: Some("ota".to_string()),
            mqtt_ip: Some("192.168.1.3".to_string()),
            mqtt_port: Some("1883".to_string()),
            mqttuser: Some("user".to_string()),
            mqttpass: Some("pass".to_string()),
            additional_param: Some("2".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_arduino_file_layout() {
        let json = r#"{
            "deviceName": "GLOW_WORM",
            "microcontrollerIP": "DHCP",
            "qsid": "home",
            "qpass": "secret",
            "OTApass": "ota",
            "mqttIP": "192.168.1.3",
            "mqttPort": "1883",
            "mqttuser": "",
            "mqttpass": "",
            "additionalParam": "2"
        }"#;
        let record: DeviceConfigRecord = serde_json::from_str(json).unwrap();
        let config = DeviceConfig::try_from(record).unwrap();

        assert_eq!(config.device_name, "GLOW_WORM");
        assert_eq!(config.addressing, AddressMode::Dhcp);
        assert_eq!(config.wifi.ssid, "home");
        assert_eq!(config.update_passphrase.as_deref(), Some("ota"));
        let broker = config.broker.unwrap();
        assert_eq!(broker.address, Ipv4Addr::new(192, 168, 1, 3));
        assert_eq!(broker.port, 1883);
        assert!(broker.is_anonymous());
        assert_eq!(config.extension, "2");
    }

    #[test]
    fn test_numeric_port_accepted() {
        let json = r#"{"deviceName":"d","qsid":"s","mqttIP":"10.0.0.2","mqttPort":1884}"#;
        let record: DeviceConfigRecord = serde_json::from_str(json).unwrap();
        let config = DeviceConfig::try_from(record).unwrap();
        assert_eq!(config.broker.unwrap().port, 1884);
    }

    #[test]
    fn test_missing_qsid_is_unconfigured() {
        let record = DeviceConfigRecord {
            qsid: None,
            ..full_record()
        };
        assert!(matches!(
            DeviceConfig::try_from(record),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_empty_broker_disables_messaging() {
        let record = DeviceConfigRecord {
            mqtt_ip: Some(String::new()),
            mqtt_port: Some(String::new()),
            ..full_record()
        };
        let config = DeviceConfig::try_from(record).unwrap();
        assert!(!config.messaging_enabled());
    }

    #[test]
    fn test_broker_without_port_is_invalid() {
        let record = DeviceConfigRecord {
            mqtt_port: Some(String::new()),
            ..full_record()
        };
        assert!(matches!(
            DeviceConfig::try_from(record),
            Err(ConfigError::MissingField("mqttPort"))
        ));
    }

    #[test]
    fn test_static_mode_requires_all_addresses() {
        let partial = DeviceConfigRecord {
            microcontroller_ip: Some("192.168.1.99".to_string()),
            gateway_ip: Some("192.168.1.1".to_string()),
            subnet_mask: Some("255.255.255.0".to_string()),
            ..full_record()
        };
        assert!(matches!(
            DeviceConfig::try_from(partial.clone()),
            Err(ConfigError::MissingField("dnsIP"))
        ));

        let complete = DeviceConfigRecord {
            dns_ip: Some("192.168.1.1".to_string()),
            ..partial
        };
        let config = DeviceConfig::try_from(complete).unwrap();
        assert_eq!(
            config.addressing,
            AddressMode::Static(StaticAddress {
                address: Ipv4Addr::new(192, 168, 1, 99),
                gateway: Ipv4Addr::new(192, 168, 1, 1),
                subnet: Ipv4Addr::new(255, 255, 255, 0),
                dns: Ipv4Addr::new(192, 168, 1, 1),
            })
        );
    }

    #[test]
    fn test_wired_profile_selection() {
        let rmii = DeviceConfigRecord {
            ethd: Some(3),
            ..full_record()
        };
        let config = DeviceConfig::try_from(rmii).unwrap();
        assert_eq!(config.wired, Some(WiredConfig { index: 3, spi: None }));

        let unused = DeviceConfigRecord {
            ethd: Some(-1),
            ..full_record()
        };
        assert_eq!(DeviceConfig::try_from(unused).unwrap().wired, None);

        let spi = DeviceConfigRecord {
            ethd: Some(100),
            mosi: Some(11),
            miso: Some(13),
            sclk: Some(12),
            cs: Some(10),
            int: Some(-1),
            rst: Some(9),
            ..full_record()
        };
        let wired = DeviceConfig::try_from(spi).unwrap().wired.unwrap();
        assert_eq!(
            wired.spi,
            Some(SpiPins {
                mosi: 11,
                miso: 13,
                sclk: 12,
                cs: 10,
                interrupt: None,
                reset: Some(9),
            })
        );
    }

    #[test]
    fn test_spi_profile_without_pins_is_invalid() {
        let record = DeviceConfigRecord {
            ethd: Some(101),
            ..full_record()
        };
        assert!(matches!(
            DeviceConfig::try_from(record),
            Err(ConfigError::MissingField("mosi"))
        ));
    }

    #[test]
    fn test_record_round_trip_preserves_config() {
        let config = DeviceConfig::try_from(full_record()).unwrap();
        let record = DeviceConfigRecord::from(&config);
        assert_eq!(DeviceConfig::try_from(record).unwrap(), config);
    }

    #[test]
    fn test_disabled_broker_written_as_empty_strings() {
        let config = DeviceConfig::for_wifi("dev_12", "test", "");
        let json = serde_json::to_value(DeviceConfigRecord::from(&config)).unwrap();
        assert_eq!(json["qsid"], "test");
        assert_eq!(json["microcontrollerIP"], "DHCP");
        assert_eq!(json["mqttIP"], "");
        assert_eq!(json["mqttPort"], "");
        assert_eq!(json["ethd"], -1);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryConfigStore::new();
        assert!(!store.exists());
        assert!(store.configured().is_none());

        let config = DeviceConfig::for_wifi("dev", "home", "pw");
        store.save(&config).unwrap();
        assert!(store.exists());
        assert_eq!(store.load().unwrap(), config);

        // Clones share the slot
        let other = store.clone();
        other.erase().unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn test_memory_store_with_config() {
        let config = DeviceConfig::for_wifi("dev", "home", "pw");
        let store = MemoryConfigStore::with_config(&config);
        assert_eq!(store.configured(), Some(config));
        assert!(store.raw().is_some_and(|json| json.contains("\"qsid\":\"home\"")));
    }

    #[test]
    fn test_memory_store_read_only() {
        let store = MemoryConfigStore::new();
        store.set_read_only(true);
        let result = store.save(&DeviceConfig::for_wifi("dev", "home", "pw"));
        assert!(matches!(result, Err(ConfigError::WriteError(_))));
        assert!(!store.exists());
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::in_dir(dir.path());
        assert!(matches!(store.load(), Err(ConfigError::NotFound(_))));

        let config = DeviceConfig::try_from(full_record()).unwrap();
        store.save(&config).unwrap();
        assert!(store.path().ends_with(CONFIG_FILE_NAME));
        assert_eq!(store.load().unwrap(), config);

        store.erase().unwrap();
        assert!(!store.exists());
        // Erasing twice is fine
        store.erase().unwrap();
    }

    #[test]
    fn test_file_store_corrupt_file_is_unconfigured() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::in_dir(dir.path());
        std::fs::write(store.path(), "{\"qsid\": \"tru").unwrap();

        assert!(matches!(store.load(), Err(ConfigError::InvalidData(_))));
        assert!(store.configured().is_none());
    }
}
