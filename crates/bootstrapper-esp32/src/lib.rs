//! ESP32 drivers for the device bootstrapper.
//!
//! This crate implements the `bootstrapper-core` platform traits on top of
//! ESP-IDF:
//! - [`wifi::EspLink`]: station-mode WiFi link driver
//! - [`store::NvsConfigStore`]: device record kept in NVS flash
//! - [`console::UartConsole`]: provisioning frames over a UART
//! - [`system::EspSystem`]: restart and task watchdog
//! - [`mqtt::EspMqttTransport`]: broker transport on the IDF MQTT client
//! - [`ota::EspOtaUpdater`]: firmware uploads into the inactive OTA slot
//!
//! The firmware binary builds a `Platform` from these and hands it to the
//! runtime's `Bootstrapper`. Requires the ESP32 Rust toolchain.
//!
//! # Example
//!
//! ```ignore
//! let peripherals = Peripherals::take()?;
//! let sysloop = EspSystemEventLoop::take()?;
//! let nvs = EspDefaultNvsPartition::take()?;
//!
//! let link = EspLink::new(peripherals.modem, sysloop, Some(nvs.clone()))?;
//! let store = NvsConfigStore::new(nvs)?;
//! let broker = EspMqttTransport::new();
//! let updater = EspOtaUpdater::new();
//! ```

pub mod console;
pub mod mqtt;
pub mod ota;
pub mod store;
pub mod system;
pub mod wifi;

pub use console::UartConsole;
pub use mqtt::EspMqttTransport;
pub use ota::EspOtaUpdater;
pub use store::NvsConfigStore;
pub use system::EspSystem;
pub use wifi::EspLink;
