//! Runtime settings.
//!
//! Compile-time knobs of the firmware, expressed as a plain struct. `Default`
//! carries the stock values; a product overrides what it needs.

use bootstrapper_core::{DeviceConfig, RetryPolicy, Will};
use std::time::Duration;

/// Base name used when nothing else names the device.
pub const DEFAULT_DEVICE_NAME: &str = "ArduinoBootstrapper";

/// Default firmware-update listener port.
pub const DEFAULT_UPDATE_PORT: u16 = 8199;

/// Bootstrapper settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Prefix of the name given to freshly provisioned devices.
    pub base_device_name: String,
    /// Four-character firmware tag reported in device info.
    pub firmware_tag: String,
    pub firmware_version: String,
    pub hardware_family: String,
    pub update_port: u16,
    /// Used when the stored record has no update passphrase.
    pub default_update_passphrase: String,
    pub retry: RetryPolicy,
    /// Keep retrying the broker inside one tick instead of once per tick.
    pub blocking_broker: bool,
    pub will: Will,
    /// Keep listening for provisioning frames once configured.
    pub provisioning_after_boot: bool,
    /// Wait quanta granted to the join after new credentials arrive.
    pub join_quanta: u32,
    /// Pause between two steady-state ticks.
    pub tick_interval: Duration,
    /// Built-in configuration. Takes precedence over the stored record.
    pub preset: Option<DeviceConfig>,
    /// Topic carrying the current time. Subscribed on every fresh session.
    pub time_topic: Option<String>,
    /// Gateway ping period while the link is up. `None` disables pinging.
    pub keepalive_interval: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_device_name: DEFAULT_DEVICE_NAME.to_string(),
            firmware_tag: "BOOT".to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            hardware_family: "ESP32".to_string(),
            update_port: DEFAULT_UPDATE_PORT,
            default_update_passphrase: String::new(),
            retry: RetryPolicy::default(),
            blocking_broker: true,
            will: Will::default(),
            provisioning_after_boot: true,
            join_quanta: 20,
            tick_interval: Duration::from_millis(10),
            preset: None,
            time_topic: None,
            keepalive_interval: None,
        }
    }
}

impl Settings {
    /// Firmware tag padded or cut to exactly four bytes.
    pub fn fixed_firmware_tag(&self) -> String {
        let mut tag: String = self.firmware_tag.chars().filter(char::is_ascii).take(4).collect();
        while tag.len() < 4 {
            tag.push(' ');
        }
        tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.update_port, 8199);
        assert_eq!(settings.retry.max_reconnect, 500);
        assert!(!settings.retry.fast_disconnect);
        assert!(settings.blocking_broker);
        assert!(!settings.will.is_enabled());
        assert_eq!(settings.time_topic, None);
        assert_eq!(settings.keepalive_interval, None);
    }

    #[test]
    fn test_fixed_firmware_tag() {
        let mut settings = Settings::default();
        assert_eq!(settings.fixed_firmware_tag(), "BOOT");
        settings.firmware_tag = "GW".to_string();
        assert_eq!(settings.fixed_firmware_tag(), "GW  ");
        settings.firmware_tag = "GLOWWORM".to_string();
        assert_eq!(settings.fixed_firmware_tag(), "GLOW");
    }
}
