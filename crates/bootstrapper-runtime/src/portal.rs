//! Captive-portal submissions.
//!
//! The setup page itself is served elsewhere. Its form posts land here as a
//! [`PortalSubmission`], get validated into a [`DeviceConfig`], and on
//! success are written to the store before the device restarts into normal
//! boot. A rejected submission leaves the store untouched.

use crate::error::PortalError;
use bootstrapper_core::{ConfigStore, DeviceConfig, DeviceConfigRecord, SystemControl};
use serde::Deserialize;
use std::sync::mpsc::Receiver;
use tracing::{info, warn};

/// Gateway assumed for static addressing when the form leaves it out.
pub const DEFAULT_GATEWAY: &str = "192.168.1.1";
pub const DEFAULT_SUBNET: &str = "255.255.255.0";
pub const DEFAULT_DNS: &str = "192.168.1.1";

/// Fields of the setup form, named as the page sends them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PortalSubmission {
    #[serde(rename = "deviceName")]
    pub device_name: String,
    /// Empty or `DHCP` for dynamic addressing.
    #[serde(rename = "microcontrollerIP")]
    pub microcontroller_ip: String,
    #[serde(rename = "gatewayIP")]
    pub gateway_ip: String,
    #[serde(rename = "subnetMask")]
    pub subnet_mask: String,
    #[serde(rename = "dnsIP")]
    pub dns_ip: String,
    pub ssid: String,
    pub pass: String,
    #[serde(rename = "OTApass")]
    pub ota_pass: String,
    /// Any non-empty value enables messaging.
    #[serde(rename = "mqttCheckbox")]
    pub mqtt_checkbox: String,
    #[serde(rename = "mqttIP")]
    pub mqtt_ip: String,
    #[serde(rename = "mqttPort")]
    pub mqtt_port: String,
    pub mqttuser: String,
    pub mqttpass: String,
    #[serde(rename = "additionalParam")]
    pub additional_param: String,
}

fn require(value: &str, field: &'static str) -> Result<(), PortalError> {
    if value.trim().is_empty() {
        Err(PortalError::MissingField(field))
    } else {
        Ok(())
    }
}

fn or_default(value: &str, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

impl PortalSubmission {
    pub fn messaging_enabled(&self) -> bool {
        !self.mqtt_checkbox.is_empty()
    }

    /// Check mandatory fields and build the record.
    pub fn validate(&self) -> Result<DeviceConfig, PortalError> {
        require(&self.device_name, "deviceName")?;
        require(&self.ssid, "ssid")?;
        require(&self.pass, "pass")?;
        require(&self.ota_pass, "OTApass")?;
        if self.messaging_enabled() {
            require(&self.mqtt_ip, "mqttIP")?;
            require(&self.mqtt_port, "mqttPort")?;
        }

        let dhcp = self.microcontroller_ip.trim().is_empty()
            || self.microcontroller_ip.eq_ignore_ascii_case("DHCP");
        let (microcontroller_ip, gateway_ip, subnet_mask, dns_ip) = if dhcp {
            ("DHCP".to_string(), None, None, None)
        } else {
            (
                self.microcontroller_ip.clone(),
                Some(or_default(&self.gateway_ip, DEFAULT_GATEWAY)),
                Some(or_default(&self.subnet_mask, DEFAULT_SUBNET)),
                Some(or_default(&self.dns_ip, DEFAULT_DNS)),
            )
        };

        let messaging = self.messaging_enabled();
        let broker_field = |value: &str| Some(if messaging { value.to_string() } else { String::new() });

        let record = DeviceConfigRecord {
            device_name: Some(self.device_name.clone()),
            microcontroller_ip: Some(microcontroller_ip),
            gateway_ip,
            subnet_mask,
            dns_ip,
            qsid: Some(self.ssid.clone()),
            qpass: Some(self.pass.clone()),
            ota_pass: Some(self.ota_pass.clone()),
            mqtt_ip: broker_field(&self.mqtt_ip),
            mqtt_port: broker_field(&self.mqtt_port),
            mqttuser: broker_field(&self.mqttuser),
            mqttpass: broker_field(&self.mqttpass),
            additional_param: Some(self.additional_param.clone()),
            ..Default::default()
        };
        DeviceConfig::try_from(record).map_err(PortalError::Invalid)
    }

    /// Validate, persist, restart.
    pub fn apply(
        &self,
        store: &dyn ConfigStore,
        system: &mut dyn SystemControl,
    ) -> Result<DeviceConfig, PortalError> {
        let config = match self.validate() {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Rejected setup submission");
                return Err(e);
            }
        };
        store.save(&config).map_err(PortalError::Store)?;
        info!(device = %config.device_name, "Success: rebooting the microcontroller using your credentials.");
        system.restart();
        Ok(config)
    }
}

/// Source of form submissions collected by the web server.
pub trait PortalSource: Send {
    /// Next pending submission. Never blocks.
    fn next_submission(&mut self) -> Option<PortalSubmission>;
}

impl PortalSource for Receiver<PortalSubmission> {
    fn next_submission(&mut self) -> Option<PortalSubmission> {
        self.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bootstrapper_core::sim::RecordingSystem;
    use bootstrapper_core::{AddressMode, MemoryConfigStore};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn submission() -> PortalSubmission {
        PortalSubmission {
            device_name: "GLOW_WORM".to_string(),
            ssid: "home".to_string(),
            pass: "secret".to_string(),
            ota_pass: "ota".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_query_field_names() {
        let json = serde_json::json!({
            "deviceName": "dev",
            "ssid": "home",
            "pass": "pw",
            "OTApass": "ota",
            "mqttCheckbox": "on",
            "mqttIP": "192.168.1.3",
            "mqttPort": "1883"
        });
        let parsed: PortalSubmission = serde_json::from_value(json).unwrap();
        assert!(parsed.messaging_enabled());
        assert_eq!(parsed.ota_pass, "ota");
        assert_eq!(parsed.microcontroller_ip, "");
    }

    #[test]
    fn test_minimal_submission_is_dhcp_without_broker() {
        let config = submission().validate().unwrap();
        assert_eq!(config.addressing, AddressMode::Dhcp);
        assert!(config.broker.is_none());
        assert_eq!(config.update_passphrase.as_deref(), Some("ota"));
    }

    #[test]
    fn test_required_fields() {
        for (field, blank) in [
            ("deviceName", PortalSubmission { device_name: String::new(), ..submission() }),
            ("ssid", PortalSubmission { ssid: String::new(), ..submission() }),
            ("pass", PortalSubmission { pass: String::new(), ..submission() }),
            ("OTApass", PortalSubmission { ota_pass: String::new(), ..submission() }),
        ] {
            match blank.validate() {
                Err(PortalError::MissingField(missing)) => assert_eq!(missing, field),
                other => panic!("expected missing {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_broker_fields_required_when_enabled() {
        let enabled = PortalSubmission {
            mqtt_checkbox: "on".to_string(),
            mqtt_ip: "192.168.1.3".to_string(),
            ..submission()
        };
        assert!(matches!(enabled.validate(), Err(PortalError::MissingField("mqttPort"))));

        let complete = PortalSubmission {
            mqtt_port: "1883".to_string(),
            ..enabled
        };
        let broker = complete.validate().unwrap().broker.unwrap();
        assert_eq!(broker.address, Ipv4Addr::new(192, 168, 1, 3));
    }

    #[test]
    fn test_broker_fields_ignored_when_disabled() {
        let config = PortalSubmission {
            mqtt_ip: "192.168.1.3".to_string(),
            mqtt_port: "1883".to_string(),
            ..submission()
        }
        .validate()
        .unwrap();
        assert!(config.broker.is_none());
    }

    #[test]
    fn test_static_address_uses_default_gateway() {
        let config = PortalSubmission {
            microcontroller_ip: "192.168.1.99".to_string(),
            ..submission()
        }
        .validate()
        .unwrap();
        match config.addressing {
            AddressMode::Static(fixed) => {
                assert_eq!(fixed.address, Ipv4Addr::new(192, 168, 1, 99));
                assert_eq!(fixed.gateway, Ipv4Addr::new(192, 168, 1, 1));
                assert_eq!(fixed.subnet, Ipv4Addr::new(255, 255, 255, 0));
            }
            other => panic!("expected static, got {other:?}"),
        }
    }

    #[test]
    fn test_apply_writes_and_restarts() {
        let store = MemoryConfigStore::new();
        let mut system = RecordingSystem::new();
        submission().apply(&store, &mut system).unwrap();
        assert_eq!(store.load().unwrap().wifi.ssid, "home");
        assert_eq!(system.restarts(), 1);
    }

    #[test]
    fn test_apply_rejection_leaves_store_untouched() {
        let existing = DeviceConfig::for_wifi("old", "old-net", "pw");
        let store = MemoryConfigStore::with_config(&existing);
        let mut system = RecordingSystem::new();

        let bad = PortalSubmission {
            microcontroller_ip: "not-an-ip".to_string(),
            ..submission()
        };
        assert!(matches!(bad.apply(&store, &mut system), Err(PortalError::Invalid(_))));
        assert_eq!(store.load().unwrap(), existing);
        assert_eq!(system.restarts(), 0);
    }

    #[test]
    fn test_channel_source() {
        let (tx, mut rx) = std::sync::mpsc::channel();
        assert!(rx.next_submission().is_none());
        tx.send(submission()).unwrap();
        assert_eq!(rx.next_submission(), Some(submission()));
    }
}
