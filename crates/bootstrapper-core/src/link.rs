//! Network link driver abstraction.
//!
//! The radio and wired stacks live outside this crate. A [`LinkDriver`]
//! exposes the handful of operations the connectivity state machine needs.
//! Which interface to bring up is decided once, at startup, from the stored
//! record and carried as a [`LinkProfile`].

use crate::config::{AddressMode, DeviceConfig, SpiPins, WifiCredentials};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Link driver errors.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The driver rejected the profile (bad pins, unsupported board index).
    #[error("Unsupported link profile: {0}")]
    Unsupported(String),

    /// The underlying stack reported a failure while starting.
    #[error("Link start failed: {0}")]
    Start(String),

    /// The link is not started.
    #[error("Link not started")]
    NotStarted,
}

/// Station-mode wireless profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiProfile {
    pub hostname: String,
    pub credentials: WifiCredentials,
    pub addressing: AddressMode,
}

/// Wired fallback profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiredProfile {
    pub hostname: String,
    /// RMII board profile index, or SPI profile index when `spi` is set.
    pub index: u8,
    pub spi: Option<SpiPins>,
    pub addressing: AddressMode,
}

/// Which interface to bring up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkProfile {
    Wireless(WifiProfile),
    Wired(WiredProfile),
}

impl LinkProfile {
    /// Select the profile for a stored record.
    pub fn from_config(config: &DeviceConfig) -> Self {
        match config.wired {
            Some(wired) => LinkProfile::Wired(WiredProfile {
                hostname: config.device_name.clone(),
                index: wired.index,
                spi: wired.spi,
                addressing: config.addressing,
            }),
            None => LinkProfile::Wireless(WifiProfile {
                hostname: config.device_name.clone(),
                credentials: config.wifi.clone(),
                addressing: config.addressing,
            }),
        }
    }

    pub fn hostname(&self) -> &str {
        match self {
            LinkProfile::Wireless(p) => &p.hostname,
            LinkProfile::Wired(p) => &p.hostname,
        }
    }

    pub fn is_wired(&self) -> bool {
        matches!(self, LinkProfile::Wired(_))
    }
}

/// Read-only view of link status.
///
/// The broker session only needs to know whether the link is up, so it
/// takes this instead of the full manager.
pub trait LinkStatus {
    fn is_up(&self) -> bool;
}

impl LinkStatus for bool {
    fn is_up(&self) -> bool {
        *self
    }
}

/// Platform network interface.
///
/// All methods are synchronous and must return promptly. `begin` starts
/// the join in the background; progress is observed through `is_up`.
pub trait LinkDriver: Send {
    /// Configure the interface and start joining.
    fn begin(&mut self, profile: &LinkProfile) -> Result<(), LinkError>;

    /// Whether the interface currently holds an address.
    fn is_up(&self) -> bool;

    /// The address held by the interface.
    fn local_address(&self) -> Option<Ipv4Addr>;

    /// Received signal strength in dBm, `None` for wired links.
    fn rssi(&self) -> Option<i32>;

    /// Ask the stack to join again after a loss.
    fn rejoin(&mut self) -> Result<(), LinkError>;

    /// Leave the network.
    fn disconnect(&mut self);

    /// Hardware MAC address as `AA:BB:CC:DD:EE:FF`.
    fn mac_address(&self) -> Option<String> {
        None
    }

    /// Send one echo request to the default gateway.
    ///
    /// `None` when the platform cannot ping.
    fn ping_gateway(&mut self) -> Option<bool> {
        None
    }
}

impl<D: LinkDriver + ?Sized> LinkDriver for Box<D> {
    fn begin(&mut self, profile: &LinkProfile) -> Result<(), LinkError> {
        (**self).begin(profile)
    }

    fn is_up(&self) -> bool {
        (**self).is_up()
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        (**self).local_address()
    }

    fn rssi(&self) -> Option<i32> {
        (**self).rssi()
    }

    fn rejoin(&mut self) -> Result<(), LinkError> {
        (**self).rejoin()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn mac_address(&self) -> Option<String> {
        (**self).mac_address()
    }

    fn ping_gateway(&mut self) -> Option<bool> {
        (**self).ping_gateway()
    }
}
