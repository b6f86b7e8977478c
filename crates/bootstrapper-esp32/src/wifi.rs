//! Station-mode WiFi link driver for ESP32.
//!
//! `begin` configures and starts the station and issues a connect without
//! waiting; the connectivity state machine polls `is_up` between its
//! retry quanta. Wired profiles are rejected on this board.

use bootstrapper_core::{AddressMode, LinkDriver, LinkError, LinkProfile, StaticAddress, WifiProfile};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, peripheral},
    ipv4::{self, Mask, Subnet},
    netif::{EspNetif, NetifConfiguration},
    nvs::EspDefaultNvsPartition,
    ping::{self, EspPing},
    wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi},
};
use log::{info, warn};
use std::net::Ipv4Addr;

pub struct EspLink {
    wifi: Box<EspWifi<'static>>,
}

impl EspLink {
    pub fn new(
        modem: impl peripheral::Peripheral<P = Modem> + 'static,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
    ) -> anyhow::Result<Self> {
        let wifi = EspWifi::new(modem, sysloop, nvs)?;
        Ok(Self {
            wifi: Box::new(wifi),
        })
    }

    fn apply_static(&mut self, fixed: &StaticAddress) -> Result<(), LinkError> {
        let prefix = u32::from(fixed.subnet).leading_ones() as u8;
        let conf = NetifConfiguration {
            ip_configuration: Some(ipv4::Configuration::Client(
                ipv4::ClientConfiguration::Fixed(ipv4::ClientSettings {
                    ip: fixed.address,
                    subnet: Subnet {
                        gateway: fixed.gateway,
                        mask: Mask(prefix),
                    },
                    dns: Some(fixed.dns),
                    secondary_dns: None,
                }),
            )),
            ..NetifConfiguration::wifi_default_client()
        };
        let netif = EspNetif::new_with_conf(&conf).map_err(|e| LinkError::Start(e.to_string()))?;
        self.wifi
            .swap_netif_sta(netif)
            .map_err(|e| LinkError::Start(e.to_string()))?;
        Ok(())
    }

    fn configure(&mut self, profile: &WifiProfile) -> Result<(), LinkError> {
        if let AddressMode::Static(fixed) = &profile.addressing {
            self.apply_static(fixed)?;
        }
        if let Err(e) = self.wifi.sta_netif_mut().set_hostname(&profile.hostname) {
            warn!("Unable to set hostname {}: {}", profile.hostname, e);
        }

        let credentials = &profile.credentials;
        let auth_method = if credentials.passphrase.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };
        let client = ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| LinkError::Unsupported("SSID longer than 32 bytes".to_string()))?,
            password: credentials
                .passphrase
                .as_str()
                .try_into()
                .map_err(|_| LinkError::Unsupported("passphrase longer than 64 bytes".to_string()))?,
            auth_method,
            ..Default::default()
        };
        self.wifi
            .set_configuration(&Configuration::Client(client))
            .map_err(|e| LinkError::Start(e.to_string()))
    }
}

impl LinkDriver for EspLink {
    fn begin(&mut self, profile: &LinkProfile) -> Result<(), LinkError> {
        let LinkProfile::Wireless(wifi) = profile else {
            return Err(LinkError::Unsupported(
                "no wired controller on this board".to_string(),
            ));
        };
        self.configure(wifi)?;
        self.wifi.start().map_err(|e| LinkError::Start(e.to_string()))?;
        info!("Connecting to '{}'...", wifi.credentials.ssid);
        self.wifi.connect().map_err(|e| LinkError::Start(e.to_string()))
    }

    fn is_up(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.local_address().is_some()
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        let info = self.wifi.sta_netif().get_ip_info().ok()?;
        (!info.ip.is_unspecified()).then_some(info.ip)
    }

    fn rssi(&self) -> Option<i32> {
        let mut record = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut record) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(i32::from(record.rssi))
    }

    fn rejoin(&mut self) -> Result<(), LinkError> {
        self.wifi.connect().map_err(|e| LinkError::Start(e.to_string()))
    }

    fn disconnect(&mut self) {
        if let Err(e) = self.wifi.disconnect() {
            warn!("WiFi disconnect failed: {}", e);
        }
    }

    fn mac_address(&self) -> Option<String> {
        let mac = self.wifi.sta_netif().get_mac().ok()?;
        Some(
            mac.iter()
                .map(|b| format!("{b:02X}"))
                .collect::<Vec<_>>()
                .join(":"),
        )
    }

    fn ping_gateway(&mut self) -> Option<bool> {
        let gateway = self.wifi.sta_netif().get_ip_info().ok()?.subnet.gateway;
        let conf = ping::Configuration {
            count: 1,
            ..Default::default()
        };
        match EspPing::default().ping(gateway, &conf) {
            Ok(summary) => Some(summary.received > 0),
            Err(e) => {
                warn!("Ping {} failed: {}", gateway, e);
                Some(false)
            }
        }
    }
}
