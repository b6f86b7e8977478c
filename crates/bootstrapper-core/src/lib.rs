//! # bootstrapper-core
//!
//! Device configuration and connection state machines.
//!
//! This crate provides:
//! - The persisted device record and its storage abstraction
//! - The bounded retry counter with escalation thresholds
//! - `ConnectivityManager` for station-link acquisition and loss
//! - `BrokerSession` for the message-broker session on top of the link
//! - Platform traits (link driver, broker transport, clock, updater, watchdog)
//! - Simulated platform doubles for tests and host runs
//!
//! This crate is intentionally runtime-agnostic and contains no async code,
//! making it usable on both Linux (tokio) and ESP32 (esp-idf) targets.

pub mod broker;
pub mod config;
pub mod connectivity;
pub mod hooks;
pub mod link;
pub mod platform;
pub mod retry;
pub mod session;
pub mod sim;

pub use broker::{
    BrokerError, BrokerTransport, ConnectOptions, Credentials, InboundMessage, QoS, Subscription,
    Will,
};
pub use config::{
    AddressMode, BrokerConfig, ConfigError, ConfigStore, DeviceConfig, DeviceConfigRecord,
    FileConfigStore, MemoryConfigStore, SpiPins, StaticAddress, WifiCredentials, WiredConfig,
};
pub use connectivity::{ConnectivityManager, ConnectivityState, LinkStep};
pub use hooks::{DeviceHooks, NoopHooks, ServicedHooks};
pub use link::{LinkDriver, LinkError, LinkProfile, LinkStatus, WifiProfile, WiredProfile};
pub use platform::{
    ByteStream, Clock, FirmwareUpdater, SystemClock, SystemControl, UpdateError, UpdateEvent,
    UpdateOptions, Watchdog,
};
pub use retry::{Escalation, RetryCounter, RetryPolicy};
pub use session::{BrokerSession, BrokerSessionState, ConnectOutcome, PublishOutcome};
